//! Event flag groups
//!
//! A task owns one group and blocks on it; any task may set bits. A wake takes
//! every pending masked bit at once, so the owner drains them in its own fixed
//! order and a flag set several times before the wake is seen once.

use std::marker::PhantomData;
use std::time::Duration;

use bitflags::Flags;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Event flag group with wait-any semantics
pub struct EventGroup<F> {
    pending: Mutex<u32>,
    notify: Notify,
    _flags: PhantomData<F>,
}

impl<F> Default for EventGroup<F>
where
    F: Flags<Bits = u32> + Copy + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F> EventGroup<F>
where
    F: Flags<Bits = u32> + Copy + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            notify: Notify::new(),
            _flags: PhantomData,
        }
    }

    /// Raise flags and wake the waiters
    pub fn set(&self, flags: F) {
        *self.pending.lock() |= flags.bits();
        self.notify.notify_waiters();
    }

    /// Take the pending flags selected by `mask` without waiting
    pub fn try_take(&self, mask: F) -> Option<F> {
        let mut pending = self.pending.lock();
        let taken = *pending & mask.bits();
        if taken == 0 {
            return None;
        }
        *pending &= !taken;
        Some(F::from_bits_truncate(taken))
    }

    /// Wait until any flag in `mask` is pending, then take all pending masked flags
    pub async fn wait(&self, mask: F) -> F {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent set is not lost
            notified.as_mut().enable();
            if let Some(flags) = self.try_take(mask) {
                return flags;
            }
            notified.await;
        }
    }

    /// Bounded [`wait`](Self::wait); `None` on timeout
    pub async fn wait_timeout(&self, mask: F, timeout: Duration) -> Option<F> {
        tokio::time::timeout(timeout, self.wait(mask)).await.ok()
    }

    /// Drop pending flags without handling them
    pub fn clear(&self, flags: F) {
        *self.pending.lock() &= !flags.bits();
    }

    /// Pending flags, left untouched
    pub fn peek(&self) -> F {
        F::from_bits_truncate(*self.pending.lock())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::Arc;

    bitflags::bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        struct TestFlags: u32 {
            const A = 0x01;
            const B = 0x02;
            const C = 0x04;
        }
    }

    #[test]
    fn test_unknown_bits_are_dropped() {
        let group = EventGroup::<TestFlags>::new();
        group.set(TestFlags::from_bits_retain(0xF1));
        assert_eq!(group.peek(), TestFlags::A);
    }

    #[tokio::test]
    async fn test_wait_takes_all_masked_bits() {
        let group = EventGroup::<TestFlags>::new();
        group.set(TestFlags::A);
        group.set(TestFlags::B);
        group.set(TestFlags::C);

        let got = group.wait(TestFlags::A | TestFlags::B).await;
        assert_eq!(got, TestFlags::A | TestFlags::B);
        assert_eq!(group.peek(), TestFlags::C);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_set_from_other_task() {
        let group = Arc::new(EventGroup::<TestFlags>::new());
        let waiter = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.wait(TestFlags::B).await })
        };
        tokio::task::yield_now().await;
        group.set(TestFlags::A);
        group.set(TestFlags::B);
        assert_eq!(waiter.await.unwrap(), TestFlags::B);
        assert_eq!(group.peek(), TestFlags::A);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_expires() {
        let group = EventGroup::<TestFlags>::new();
        assert!(group
            .wait_timeout(TestFlags::A, Duration::from_millis(50))
            .await
            .is_none());
    }

    #[test]
    fn test_coalesced_flag_seen_once() {
        let group = EventGroup::<TestFlags>::new();
        group.set(TestFlags::A);
        group.set(TestFlags::A);
        assert_eq!(group.try_take(TestFlags::A), Some(TestFlags::A));
        assert_eq!(group.try_take(TestFlags::A), None);
    }
}
