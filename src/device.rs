//! Device context for adapter loading and unloading.
//!
//! Accelerator concerns (cache release, free-memory telemetry) are passed in
//! explicitly instead of being looked up from process-wide globals. Embedders
//! construct one [`DeviceContext`] per device and hand it to the manager
//! functions that touch device memory.

use std::fmt;

use candle_core::Device;

/// Callback reporting free device memory in gigabytes.
///
/// Returns `None` when the amount cannot be determined for the given device.
pub type MemoryReporter = dyn Fn(&Device) -> Option<f64> + Send + Sync;

/// Explicit device context: the device plus optional memory instrumentation.
pub struct DeviceContext {
    device: Device,
    memory_reporter: Option<Box<MemoryReporter>>,
}

impl DeviceContext {
    /// Create a context for the given device with no memory instrumentation.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            memory_reporter: None,
        }
    }

    /// Create a CPU context.
    #[must_use]
    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// Attach a free-memory reporter.
    ///
    /// Load/unload telemetry only logs memory figures when a reporter is
    /// attached; querying free accelerator memory is driver-specific and
    /// left to the embedder.
    #[must_use]
    pub fn with_memory_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&Device) -> Option<f64> + Send + Sync + 'static,
    {
        self.memory_reporter = Some(Box::new(reporter));
        self
    }

    /// The wrapped device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether the device is an accelerator (anything other than the CPU).
    #[must_use]
    pub fn is_accelerator(&self) -> bool {
        !matches!(self.device, Device::Cpu)
    }

    /// Free device memory in gigabytes, if a reporter is attached and the
    /// device supports the query.
    #[must_use]
    pub fn free_memory_gb(&self) -> Option<f64> {
        self.memory_reporter
            .as_ref()
            .and_then(|reporter| reporter(&self.device))
    }

    /// Release cached device memory, best effort.
    ///
    /// On accelerators this synchronizes the device so freed allocations are
    /// actually returned; on the CPU it is a no-op. Failures are logged and
    /// swallowed since cache release is purely an optimization.
    pub fn release_cache(&self) {
        if !self.is_accelerator() {
            return;
        }
        if let Err(err) = self.device.synchronize() {
            tracing::debug!(error = %err, "device cache release failed");
        }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("has_memory_reporter", &self.memory_reporter.is_some())
            .finish()
    }
}
