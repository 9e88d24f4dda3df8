//! Device and memory configuration objects
//!
//! Both objects deserialize from the JSON property documents used to
//! describe devices (`{"mode": "CUDA", "deviceID": 0}`) and memory requests
//! (`{"async": true}`). Keys that lattice does not recognize are kept in
//! `extra` so callers can round-trip their own settings.

use std::env;

use lattice_backends::{MallocKind, Mode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Environment variable holding a JSON device description
pub const ENV_DEVICE: &str = "LATTICE_DEVICE";

/// Device construction options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Backend family
    pub mode: Mode,

    /// Ordinal of the device within its platform
    #[serde(rename = "deviceID", alias = "device_id", default)]
    pub device_id: u32,

    /// OpenCL platform ordinal; ignored by the other modes
    #[serde(rename = "platformID", alias = "platform_id", default)]
    pub platform_id: u32,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self::new(Mode::Cuda)
    }
}

impl DeviceProperties {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            device_id: 0,
            platform_id: 0,
            extra: Map::new(),
        }
    }

    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_platform_id(mut self, platform_id: u32) -> Self {
        self.platform_id = platform_id;
        self
    }

    /// Parse a JSON device description
    ///
    /// ```
    /// use lattice_core::{DeviceProperties, Mode};
    ///
    /// let props = DeviceProperties::from_json(r#"{"mode": "OpenCL", "platformID": 1, "deviceID": 2}"#)?;
    /// assert_eq!(props.mode, Mode::OpenCl);
    /// assert_eq!((props.platform_id, props.device_id), (1, 2));
    /// # Ok::<(), lattice_core::Error>(())
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::InvalidProperties(err.to_string()))
    }

    /// Read `LATTICE_DEVICE`, defaulting to CUDA device 0 when unset
    pub fn from_env() -> Result<Self> {
        match env::var(ENV_DEVICE) {
            Ok(json) if !json.trim().is_empty() => Self::from_json(&json),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_value(self).map(|value| value.to_string()).unwrap_or_default()
    }
}

/// Options accepted by allocation and copy calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryProperties {
    /// Return without waiting for the copy to complete
    #[serde(rename = "async", default)]
    pub is_async: bool,

    /// Request unified (managed) memory
    #[serde(default)]
    pub unified: bool,

    /// Request host-mapped (pinned) memory
    #[serde(default)]
    pub host: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemoryProperties {
    /// Properties for an asynchronous copy
    pub fn asynchronous() -> Self {
        Self {
            is_async: true,
            ..Self::default()
        }
    }

    pub fn with_unified(mut self, unified: bool) -> Self {
        self.unified = unified;
        self
    }

    pub fn with_host(mut self, host: bool) -> Self {
        self.host = host;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::InvalidProperties(err.to_string()))
    }

    /// Native allocation kind these properties request on `mode`
    pub fn malloc_kind(&self, mode: Mode) -> Result<MallocKind> {
        match (self.unified, self.host) {
            (true, true) => Err(Error::InvalidProperties(
                "unified and host memory are mutually exclusive".into(),
            )),
            (true, false) if mode == Mode::OpenCl => Err(Error::InvalidProperties(format!(
                "{mode} has no unified memory"
            ))),
            (false, true) if mode == Mode::Dpcpp => Err(Error::InvalidProperties(format!(
                "{mode} does not support host-mapped memory"
            ))),
            (true, false) => Ok(MallocKind::Managed),
            (false, true) => Ok(MallocKind::HostMapped),
            (false, false) => Ok(MallocKind::Device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;

    #[test]
    fn test_device_properties_accept_both_spellings() {
        let camel = DeviceProperties::from_json(r#"{"mode": "hip", "deviceID": 3}"#).unwrap();
        let snake = DeviceProperties::from_json(r#"{"mode": "HIP", "device_id": 3}"#).unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.mode, Mode::Hip);
        assert_eq!(camel.platform_id, 0);
    }

    #[test]
    fn test_unknown_keys_are_preserved() {
        let props = DeviceProperties::from_json(r#"{"mode": "dpcpp", "kernel": {"verbose": true}}"#).unwrap();
        assert_eq!(props.mode, Mode::Dpcpp);
        assert_eq!(props.extra["kernel"]["verbose"], Value::Bool(true));
        assert!(props.to_json().contains("\"kernel\""));
    }

    #[test]
    fn test_unknown_mode_is_invalid() {
        let err = DeviceProperties::from_json(r#"{"mode": "Metal"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProperties);
        assert!(DeviceProperties::from_json("not json").is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::remove_var(ENV_DEVICE);
        assert_eq!(DeviceProperties::from_env().unwrap(), DeviceProperties::default());

        env::set_var(ENV_DEVICE, r#"{"mode": "OpenCL", "platformID": 2}"#);
        let props = DeviceProperties::from_env().unwrap();
        assert_eq!(props.mode, Mode::OpenCl);
        assert_eq!(props.platform_id, 2);
        env::remove_var(ENV_DEVICE);
    }

    #[test]
    fn test_memory_properties_json() {
        let props = MemoryProperties::from_json(r#"{"async": true, "tag": "halo"}"#).unwrap();
        assert!(props.is_async);
        assert!(!props.unified);
        assert_eq!(props.extra["tag"], Value::String("halo".into()));
        assert_eq!(MemoryProperties::from_json("{}").unwrap(), MemoryProperties::default());
    }

    #[test]
    fn test_malloc_kind_per_mode() {
        let unified = MemoryProperties::default().with_unified(true);
        let host = MemoryProperties::default().with_host(true);

        assert_eq!(unified.malloc_kind(Mode::Cuda).unwrap(), MallocKind::Managed);
        assert_eq!(unified.malloc_kind(Mode::Dpcpp).unwrap(), MallocKind::Managed);
        assert!(unified.malloc_kind(Mode::OpenCl).is_err());

        assert_eq!(host.malloc_kind(Mode::Hip).unwrap(), MallocKind::HostMapped);
        assert_eq!(host.malloc_kind(Mode::OpenCl).unwrap(), MallocKind::HostMapped);
        assert_eq!(
            host.malloc_kind(Mode::Dpcpp).unwrap_err().kind(),
            ErrorKind::InvalidProperties
        );

        let both = MemoryProperties::default().with_unified(true).with_host(true);
        assert!(both.malloc_kind(Mode::Cuda).is_err());
        assert_eq!(MemoryProperties::default().malloc_kind(Mode::Cuda).unwrap(), MallocKind::Device);
    }
}
