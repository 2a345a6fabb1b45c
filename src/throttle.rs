use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

/// A counting semaphore over bytes with a maximum. `acquire(n)` waits until the
/// charge fits; `release(n)` gives it back and wakes waiters. A single request
/// larger than the maximum is admitted alone (when nothing else is charged),
/// so one oversized message cannot wedge a session forever.
///
/// Must never be acquired while holding a pipe or messenger lock: acquisition
/// can block for as long as the dispatcher sits on its backlog.
pub struct Throttler {
    max: u64,
    current: AtomicU64,
    cond: Notify,
}

impl Throttler {
    pub fn new(max: u64) -> Throttler {
        Throttler {
            max,
            current: AtomicU64::new(0),
            cond: Notify::new(),
        }
    }

    pub fn get_max(&self) -> u64 {
        self.max
    }

    pub fn get_current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    fn try_charge(&self, amount: u64) -> bool {
        let mut cur = self.current.load(Ordering::Acquire);
        loop {
            let fits = cur + amount <= self.max || (cur == 0 && amount > self.max);
            if !fits {
                return false;
            }
            match self.current.compare_exchange_weak(
                cur,
                cur + amount,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub async fn acquire(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        loop {
            let notified = self.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_charge(amount) {
                trace!("throttler charged {} -> {}/{}", amount, self.get_current(), self.max);
                return;
            }
            notified.await;
        }
    }

    pub fn release(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        let prev = self.current.fetch_sub(amount, Ordering::AcqRel);
        debug_assert!(prev >= amount, "throttler released more than was charged");
        trace!("throttler released {} -> {}/{}", amount, self.get_current(), self.max);
        self.cond.notify_waiters();
    }
}

/// A held charge against a throttler, released when the last clone of the
/// owning message is dropped.
pub struct ThrottleDebit {
    throttler: Arc<Throttler>,
    amount: u64,
}
impl ThrottleDebit {
    pub fn new(throttler: Arc<Throttler>, amount: u64) -> ThrottleDebit {
        ThrottleDebit { throttler, amount }
    }
}
impl Drop for ThrottleDebit {
    fn drop(&mut self) {
        self.throttler.release(self.amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time;

    #[test]
    fn test_acquire_within_max() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let t = Throttler::new(100);
            t.acquire(40).await;
            t.acquire(60).await;
            assert_eq!(t.get_current(), 100);
            t.release(100);
            assert_eq!(t.get_current(), 0);
        });
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let t = Arc::new(Throttler::new(100));
            t.acquire(80).await;

            let t2 = t.clone();
            let waiter = tokio::spawn(async move {
                t2.acquire(50).await;
            });

            // the waiter cannot make progress while 80 is charged
            time::sleep(Duration::from_millis(10)).await;
            assert!(!waiter.is_finished());
            assert_eq!(t.get_current(), 80);

            t.release(80);
            waiter.await.unwrap();
            assert_eq!(t.get_current(), 50);
        });
    }

    #[test]
    fn test_oversized_request_admitted_alone() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let t = Arc::new(Throttler::new(10));
            t.acquire(5).await;

            let t2 = t.clone();
            let waiter = tokio::spawn(async move {
                t2.acquire(50).await;
            });
            time::sleep(Duration::from_millis(10)).await;
            assert!(!waiter.is_finished());

            // only once the charge drains completely may the oversized request pass
            t.release(5);
            waiter.await.unwrap();
            assert_eq!(t.get_current(), 50);
        });
    }

    #[test]
    fn test_debit_releases_on_drop() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let t = Arc::new(Throttler::new(100));
            t.acquire(30).await;
            let debit = ThrottleDebit::new(t.clone(), 30);
            assert_eq!(t.get_current(), 30);
            drop(debit);
            assert_eq!(t.get_current(), 0);
        });
    }

    #[test]
    fn test_zero_is_noop() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let t = Throttler::new(0);
            t.acquire(0).await;
            t.release(0);
            assert_eq!(t.get_current(), 0);
        });
    }
}
