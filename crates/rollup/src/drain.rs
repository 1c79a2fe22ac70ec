//! 🚰 Drain Barrier: "is everything I submitted accounted for yet?"
//!
//! Every record handed to the sink is registered here before it is queued, and settled
//! exactly once after its write attempt finishes, success or failure. The barrier
//! opens when the outstanding count hits zero.
//!
//! No polling, no sleeps. Settling to zero wakes every waiter through a [`Notify`], and
//! waiters re-check the counter after arming so a wake-up between "check" and "wait" can't
//! be lost.
//!
//! ⚠️ Only meaningful after the producer has stopped registering. Waiting while records are
//! still being submitted can open early, between one settle and the next register.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    outstanding: AtomicU64,
    drained: Notify,
}

/// 🚰 Cloneable handle. Every clone counts against the same total.
#[derive(Debug, Clone, Default)]
pub struct DrainBarrier {
    inner: Arc<Inner>,
}

impl DrainBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// ➕ `n` more records are on their way.
    pub fn register(&self, n: u64) {
        self.inner.outstanding.fetch_add(n, Ordering::AcqRel);
    }

    /// ➖ `n` records finished their write attempt. Reaching zero wakes every waiter.
    pub fn settle(&self, n: u64) {
        if n == 0 {
            return;
        }
        let before = self
            .inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(n))
            })
            .unwrap_or_default();
        if before <= n {
            self.inner.drained.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// ⏳ Resolve once nothing is outstanding. Immediately if that's already true.
    pub async fn wait_until_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            // 🔒 arm before checking, or a settle in between is a lost wake-up
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn the_one_where_nothing_submitted_means_instantly_drained() {
        let barrier = DrainBarrier::new();
        tokio::time::timeout(Duration::from_millis(100), barrier.wait_until_drained())
            .await
            .expect("💀 an empty barrier should never make anyone wait");
    }

    #[tokio::test]
    async fn the_one_where_the_barrier_waits_for_the_last_straggler() {
        let barrier = DrainBarrier::new();
        barrier.register(3);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait_until_drained().await })
        };

        barrier.settle(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "one record is still out there");
        assert_eq!(barrier.outstanding(), 1);

        barrier.settle(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("💀 the barrier should open once the last record settles")
            .expect("💀 the waiter task panicked");
    }

    #[tokio::test]
    async fn the_one_where_many_writers_settle_concurrently() {
        let barrier = DrainBarrier::new();
        barrier.register(1000);
        let mut writers = Vec::new();
        for _ in 0..10 {
            let barrier = barrier.clone();
            writers.push(tokio::spawn(async move {
                for _ in 0..100 {
                    barrier.settle(1);
                    tokio::task::yield_now().await;
                }
            }));
        }
        tokio::time::timeout(Duration::from_secs(5), barrier.wait_until_drained())
            .await
            .expect("💀 a thousand settles should drain a thousand registrations");
        for writer in writers {
            writer.await.expect("💀 a writer panicked");
        }
        assert_eq!(barrier.outstanding(), 0);
    }

    #[test]
    fn the_one_where_over_settling_floors_at_zero() {
        let barrier = DrainBarrier::new();
        barrier.register(1);
        barrier.settle(5);
        assert_eq!(barrier.outstanding(), 0);
    }
}
