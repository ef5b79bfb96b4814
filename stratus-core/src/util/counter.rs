use std::sync::atomic::{AtomicU64, Ordering};

/// Anything that hands out consecutive identifiers.
pub trait Counter {
    type Output;

    fn get_and_increment(self) -> Self::Output;
}

impl Counter for &mut u64 {
    type Output = u64;

    fn get_and_increment(self) -> Self::Output {
        let current = *self;
        *self = u64::checked_add(current, 1).expect("attempt to add with overflow");
        current
    }
}

impl Counter for &AtomicU64 {
    type Output = u64;

    fn get_and_increment(self) -> Self::Output {
        self.fetch_add(1, Ordering::SeqCst)
    }
}
