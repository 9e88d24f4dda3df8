//! Element-type tags
//!
//! A [`Dtype`] names an element type and its size in bytes. Memory carries a
//! dtype so that `length()` and `slice()` can work in elements; casting only
//! swaps the tag. Casting and typed allocation require the dtype to be
//! registered in the process-wide registry, which starts out holding the
//! built-in scalar and vector types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;

#[derive(Debug, PartialEq, Eq)]
struct DtypeInner {
    name: String,
    bytes: usize,
}

/// Element type descriptor
#[derive(Clone, PartialEq, Eq)]
pub struct Dtype(Arc<DtypeInner>);

impl Dtype {
    /// Describe a type; it is unregistered until passed to [`register`]
    pub fn new(name: impl Into<String>, bytes: usize) -> Self {
        Dtype(Arc::new(DtypeInner {
            name: name.into(),
            bytes,
        }))
    }

    /// `count` consecutive elements of `base`
    pub fn tuple(name: impl Into<String>, base: &Dtype, count: usize) -> Self {
        Self::new(name, base.bytes() * count)
    }

    /// The empty tag of uninitialized memory
    pub fn none() -> Self {
        NONE.clone()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn bytes(&self) -> usize {
        self.0.bytes
    }

    pub fn is_registered(&self) -> bool {
        REGISTRY
            .read()
            .get(self.name())
            .is_some_and(|known| known.bytes() == self.bytes())
    }
}

impl fmt::Debug for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dtype({}, {} bytes)", self.name(), self.bytes())
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

lazy_static! {
    pub static ref NONE: Dtype = Dtype::new("none", 0);
    pub static ref BYTE: Dtype = Dtype::new("byte", 1);
    pub static ref BOOL: Dtype = Dtype::new("bool", 1);
    pub static ref CHAR: Dtype = Dtype::new("char", 1);
    pub static ref SHORT: Dtype = Dtype::new("short", 2);
    pub static ref INT: Dtype = Dtype::new("int", 4);
    pub static ref LONG: Dtype = Dtype::new("long", 8);
    pub static ref HALF: Dtype = Dtype::new("half", 2);
    pub static ref FLOAT: Dtype = Dtype::new("float", 4);
    pub static ref DOUBLE: Dtype = Dtype::new("double", 8);

    pub static ref INT8: Dtype = Dtype::new("int8", 1);
    pub static ref UINT8: Dtype = Dtype::new("uint8", 1);
    pub static ref INT16: Dtype = Dtype::new("int16", 2);
    pub static ref UINT16: Dtype = Dtype::new("uint16", 2);
    pub static ref INT32: Dtype = Dtype::new("int32", 4);
    pub static ref UINT32: Dtype = Dtype::new("uint32", 4);
    pub static ref INT64: Dtype = Dtype::new("int64", 8);
    pub static ref UINT64: Dtype = Dtype::new("uint64", 8);

    pub static ref INT2: Dtype = Dtype::tuple("int2", &INT, 2);
    pub static ref INT4: Dtype = Dtype::tuple("int4", &INT, 4);
    pub static ref FLOAT2: Dtype = Dtype::tuple("float2", &FLOAT, 2);
    pub static ref FLOAT4: Dtype = Dtype::tuple("float4", &FLOAT, 4);
    pub static ref DOUBLE2: Dtype = Dtype::tuple("double2", &DOUBLE, 2);

    static ref REGISTRY: RwLock<HashMap<String, Dtype>> = {
        let builtins = [
            BYTE.clone(), BOOL.clone(), CHAR.clone(), SHORT.clone(), INT.clone(), LONG.clone(),
            HALF.clone(), FLOAT.clone(), DOUBLE.clone(),
            INT8.clone(), UINT8.clone(), INT16.clone(), UINT16.clone(),
            INT32.clone(), UINT32.clone(), INT64.clone(), UINT64.clone(),
            INT2.clone(), INT4.clone(), FLOAT2.clone(), FLOAT4.clone(), DOUBLE2.clone(),
        ];
        let map = builtins
            .into_iter()
            .map(|dtype| (dtype.name().to_string(), dtype))
            .collect();
        RwLock::new(map)
    };
}

/// Register `dtype` for casting and typed allocation
///
/// Returns `false` when the name is already taken or the type has no size.
pub fn register(dtype: &Dtype) -> bool {
    if dtype.bytes() == 0 {
        return false;
    }
    let mut registry = REGISTRY.write();
    if registry.contains_key(dtype.name()) {
        return false;
    }
    registry.insert(dtype.name().to_string(), dtype.clone());
    tracing::debug!(name = dtype.name(), bytes = dtype.bytes(), "dtype_registered");
    true
}

/// Look up a registered dtype by name
pub fn get(name: &str) -> Option<Dtype> {
    REGISTRY.read().get(name).cloned()
}

/// Rust types with a built-in dtype
pub trait HasDtype {
    fn dtype() -> Dtype;
}

macro_rules! impl_has_dtype {
    ($($ty:ty => $dtype:ident),+ $(,)?) => {
        $(
            impl HasDtype for $ty {
                fn dtype() -> Dtype {
                    $dtype.clone()
                }
            }
        )+
    };
}

impl_has_dtype! {
    bool => BOOL,
    i8 => INT8,
    u8 => UINT8,
    i16 => INT16,
    u16 => UINT16,
    i32 => INT32,
    u32 => UINT32,
    i64 => INT64,
    u64 => UINT64,
    f32 => FLOAT,
    f64 => DOUBLE,
}

/// Dtype of a Rust primitive
pub fn of<T: HasDtype>() -> Dtype {
    T::dtype()
}
