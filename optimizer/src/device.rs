use std::{fmt::Debug, sync::Arc};

/// A compute device that owns buffers and executes the work enqueued on them.
pub trait Backend: Debug + Send + Sync {
    /// The index of this device among the local devices.
    fn id(&self) -> usize;

    /// Blocks until every operation enqueued on this device has completed.
    fn synchronize(&self);
}

/// A shared handle to a device backend.
pub type Device = Arc<dyn Backend>;

/// Host backend, every operation runs eagerly on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend {
    id: usize,
}

impl CpuBackend {
    /// Creates a new `CpuBackend`.
    ///
    /// # Arguments
    /// * `id` - The local index of this device.
    ///
    /// # Returns
    /// A new `CpuBackend` instance.
    pub fn new(id: usize) -> Self {
        Self { id }
    }

    /// Creates a shareable `Device` handle for a host backend.
    pub fn device(id: usize) -> Device {
        Arc::new(Self::new(id))
    }
}

impl Backend for CpuBackend {
    fn id(&self) -> usize {
        self.id
    }

    fn synchronize(&self) {
        log::trace!(device = self.id; "synchronize");
    }
}
