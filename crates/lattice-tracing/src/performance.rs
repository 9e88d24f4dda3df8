//! Timing and bandwidth events for device memory traffic
//!
//! The memory crates report every allocation, release, copy and stream wait
//! through the helpers here so that the event names and field sets stay
//! uniform across backends.
//!
//! ```rust
//! use lattice_tracing::performance::{record_transfer, TransferDirection};
//!
//! record_transfer(4096, TransferDirection::HostToDevice, 250);
//! ```

use std::fmt;
use std::time::Instant;

/// Direction of a copy between host memory and device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    /// Copy between two different devices, staged through host memory
    PeerStaged,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostToDevice => "H2D",
            Self::DeviceToHost => "D2H",
            Self::DeviceToDevice => "D2D",
            Self::PeerStaged => "P2P",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RAII guard that measures a region and logs its duration on drop when it
/// exceeds an optional threshold.
///
/// The guard keeps its `perf` span entered until it drops, so events
/// emitted inside the region are recorded under it.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    _entered: tracing::span::EnteredSpan,
}

impl PerformanceSpan {
    /// Start timing `name`. With `threshold_us = Some(t)` the span only
    /// logs when it lasted at least `t` microseconds.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = tracing::debug_span!("perf", name = %name);
        Self::in_span(name, threshold_us, span)
    }

    /// Start timing `name` inside a caller-built span
    pub fn in_span(name: impl Into<String>, threshold_us: Option<u64>, span: tracing::Span) -> Self {
        Self {
            name: name.into(),
            threshold_us,
            start_time: Instant::now(),
            _entered: span.entered(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Microseconds since the span was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Bandwidth in MiB/s, or 0 when the duration rounds to zero.
pub fn bandwidth_mibps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    }
}

/// Record a device allocation.
pub fn record_allocation(size_bytes: usize, backend: &str, wrapped: bool, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes = size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        backend = backend,
        wrapped = wrapped,
        duration_us = duration_us,
        "memory_allocation"
    );
}

/// Record the native release of a device allocation.
pub fn record_release(size_bytes: usize, backend: &str, explicit: bool) {
    tracing::debug!(
        event = "release",
        size_bytes = size_bytes,
        backend = backend,
        explicit = explicit,
        "memory_release"
    );
}

/// Record a data transfer with bandwidth calculation.
pub fn record_transfer(bytes: usize, direction: TransferDirection, duration_us: u64) {
    let bandwidth_mbps = bandwidth_mibps(bytes, duration_us);

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        kb = bytes as f64 / 1024.0,
        direction = direction.as_str(),
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        bandwidth_gbps = bandwidth_mbps / 1024.0,
        "data_transfer"
    );
}

/// Record how long the host blocked on a stream tag.
pub fn record_stream_wait(stream_id: u64, duration_us: u64) {
    tracing::debug!(
        event = "stream_wait",
        stream = stream_id,
        duration_us = duration_us,
        "stream_wait_complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_performance_span_creation() {
        let span = PerformanceSpan::new("test_span", None);
        assert_eq!(span.name(), "test_span");
        assert_eq!(span.threshold_us, None);
    }

    #[test]
    fn test_performance_span_elapsed() {
        let span = PerformanceSpan::new("test_span", Some(1_000_000));
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn test_bandwidth_calculation() {
        // 1 MiB in 1 ms = 1000 MiB/s
        let bandwidth = bandwidth_mibps(1024 * 1024, 1000);
        assert!((bandwidth - 1000.0).abs() < 0.01);
        assert_eq!(bandwidth_mibps(4096, 0), 0.0);
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(TransferDirection::HostToDevice.to_string(), "H2D");
        assert_eq!(TransferDirection::DeviceToHost.as_str(), "D2H");
        assert_eq!(TransferDirection::DeviceToDevice.as_str(), "D2D");
        assert_eq!(TransferDirection::PeerStaged.as_str(), "P2P");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_allocation(1024, "CUDA", false, 12);
        record_release(1024, "CUDA", true);
        record_transfer(4096, TransferDirection::DeviceToDevice, 250);
        record_stream_wait(3, 40);
    }
}
