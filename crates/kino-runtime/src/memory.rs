//! Device-tagged buffers and the accounting allocator behind them.
//!
//! Every buffer in the pipeline is owned by exactly one `EvalEntry` cell at a
//! time and must come back to the allocator that produced it. The allocator
//! tracks alloc/free counts per `(device kind, device id)`; a finished job
//! must balance on every device, which the integration tests assert.
//!
//! The device tag is a placement seam: `Gpu` buffers live in host memory here,
//! but all migration decisions and accounting behave as if they did not.

use std::collections::BTreeMap;
use std::sync::Mutex;

use kino_core::types::Device;

#[derive(Debug)]
pub struct Buffer {
    device: Device,
    data: Vec<u8>,
}

impl Buffer {
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCounters {
    pub allocs: u64,
    pub frees: u64,
}

/// Allocation seam for pipeline buffers.
#[derive(Debug, Default)]
pub struct Allocator {
    counters: Mutex<BTreeMap<Device, DeviceCounters>>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&self, device: Device, len: usize) -> Buffer {
        self.count_alloc(device);
        Buffer {
            device,
            data: vec![0u8; len],
        }
    }

    /// Wraps already-materialized bytes as a fresh allocation.
    pub fn alloc_from(&self, device: Device, data: Vec<u8>) -> Buffer {
        self.count_alloc(device);
        Buffer { device, data }
    }

    /// Allocates on `device` and copies `src` into it. The source is left
    /// untouched; callers that migrate must release it themselves.
    pub fn copy_to(&self, device: Device, src: &Buffer) -> Buffer {
        let mut dst = self.alloc(device, src.len());
        dst.as_mut_slice().copy_from_slice(src.as_slice());
        dst
    }

    pub fn release(&self, buffer: Buffer) {
        if let Ok(mut guard) = self.counters.lock() {
            guard.entry(buffer.device).or_default().frees += 1;
        }
        drop(buffer);
    }

    pub fn snapshot(&self) -> BTreeMap<Device, DeviceCounters> {
        self.counters
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// True when every device has as many frees as allocations.
    pub fn balanced(&self) -> bool {
        self.snapshot().values().all(|c| c.allocs == c.frees)
    }

    fn count_alloc(&self, device: Device) {
        if let Ok(mut guard) = self.counters.lock() {
            guard.entry(device).or_default().allocs += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_balances_per_device() {
        let a = Allocator::new();
        let cpu = a.alloc(Device::cpu(), 8);
        let gpu = a.alloc(Device::gpu(1), 8);
        assert!(!a.balanced());

        a.release(cpu);
        a.release(gpu);
        assert!(a.balanced());

        let snapshot = a.snapshot();
        assert_eq!(snapshot[&Device::cpu()].allocs, 1);
        assert_eq!(snapshot[&Device::gpu(1)].frees, 1);
    }

    #[test]
    fn copy_to_allocates_on_target_device() {
        let a = Allocator::new();
        let mut src = a.alloc(Device::cpu(), 4);
        src.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);

        let dst = a.copy_to(Device::gpu(0), &src);
        assert_eq!(dst.device(), Device::gpu(0));
        assert_eq!(dst.as_slice(), &[1, 2, 3, 4]);

        a.release(src);
        a.release(dst);
        assert!(a.balanced());
    }
}
