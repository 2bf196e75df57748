use crate::{
    buffer::Buffer,
    device::Device,
    dtype::DType,
    error::{OptimErr, Result},
};

/// Carves buffers out of an exact byte reservation on a single device.
///
/// Reservations only grow, the allocator never hands out more than what was reserved.
#[derive(Debug)]
pub struct BufferAllocator {
    device: Device,
    reserved: usize,
    used: usize,
}

impl BufferAllocator {
    /// Creates a new `BufferAllocator` with an empty reservation.
    ///
    /// # Arguments
    /// * `device` - The device where buffers will live.
    ///
    /// # Returns
    /// A new `BufferAllocator` instance.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            reserved: 0,
            used: 0,
        }
    }

    /// Grows the reservation by exactly `bytes`.
    pub fn reserve_exact(&mut self, bytes: usize) {
        self.reserved += bytes;
        log::debug!(device = self.device.id(), bytes = bytes; "reserved optimizer memory");
    }

    /// Allocates a zeroed buffer out of the reservation.
    ///
    /// # Arguments
    /// * `len` - The amount of elements.
    /// * `dtype` - The element type.
    ///
    /// # Returns
    /// A new buffer or an `AllocatorExhausted` error if the reservation can't hold it.
    pub fn allocate(&mut self, len: usize, dtype: DType) -> Result<Buffer> {
        let requested = len * dtype.size();
        let available = self.available();

        if requested > available {
            return Err(OptimErr::AllocatorExhausted {
                requested,
                available,
            });
        }

        let buffer = Buffer::zeros(self.device.clone(), dtype, len)?;
        self.used += requested;
        Ok(buffer)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.reserved - self.used
    }
}
