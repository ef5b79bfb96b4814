use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Block;

/// Something whose memory is charged to a [`MemoryMeter`].
pub trait Footprint {
    fn footprint(&self) -> u64;
}

impl Footprint for Block {
    fn footprint(&self) -> u64 {
        self.size_in_bytes()
    }
}

impl<T: Footprint> Footprint for Vec<T> {
    fn footprint(&self) -> u64 {
        self.iter().map(Footprint::footprint).sum()
    }
}

/// Tracks the memory one task attempt holds.
///
/// Starts at `baseline` (memory reserved by the executor) and records the highest value
/// seen. Values are charged through [`MemoryMeter::track`] and released when the returned
/// guard is dropped.
///
/// The meter only sees what the task body reports: the blocks it reads, produces and
/// writes. Allocator overhead, store buffers and scratch space inside block functions are
/// not measured; `task_overhead` is the allowance for those. The peak is therefore an
/// accounting of the task's data, not a sample of process memory.
#[derive(Debug)]
pub struct MemoryMeter {
    current: AtomicU64,
    peak: AtomicU64,
}

impl MemoryMeter {
    pub fn new(baseline: u64) -> Self {
        Self {
            current: AtomicU64::new(baseline),
            peak: AtomicU64::new(baseline),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    fn charge(&self, bytes: u64) {
        let now = self.current.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self, bytes: u64) {
        self.current.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn track<T: Footprint>(&self, value: T) -> Tracked<'_, T> {
        let bytes = value.footprint();
        self.charge(bytes);

        Tracked {
            meter: self,
            bytes,
            value,
        }
    }
}

/// A value charged to a [`MemoryMeter`] for as long as it is alive.
#[derive(Debug)]
pub struct Tracked<'a, T> {
    meter: &'a MemoryMeter,
    bytes: u64,
    value: T,
}

impl<'a, T> Deref for Tracked<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// The charge is not re-measured after mutation, so mutations must keep the footprint.
impl<'a, T> DerefMut for Tracked<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<'a, T> Drop for Tracked<'a, T> {
    fn drop(&mut self) {
        self.meter.release(self.bytes);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::DTYPE_F64;

    #[test]
    fn test_meter() {
        let meter = MemoryMeter::new(100);
        assert_eq!(meter.peak(), 100);

        let a = meter.track(Block::zeros(DTYPE_F64, &[10]));
        {
            let b = meter.track(vec![Block::zeros(DTYPE_F64, &[5]), Block::zeros(DTYPE_F64, &[5])]);
            assert_eq!(meter.current(), 100 + 80 + 80);
            assert_eq!(b.len(), 2);
        }

        assert_eq!(meter.current(), 180);
        assert_eq!(a.num_elements(), 10);
        drop(a);

        assert_eq!(meter.current(), 100);
        assert_eq!(meter.peak(), 260);
    }
}
