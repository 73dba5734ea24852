//! Attempt op-list
//!
//! Operations issued by the transaction body are tracked so that commit and
//! rollback can act as a barrier: `wait_and_block_ops` waits for in-flight
//! operations to drain and refuses any that arrive afterwards.

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct OpState {
    in_flight: usize,
    blocked: bool,
}

#[derive(Debug, Default)]
pub(crate) struct OpList {
    state: Mutex<OpState>,
    notify: Notify,
}

impl OpList {
    /// Register an operation. Fails once the barrier is down.
    pub fn begin(&self) -> Option<OpGuard<'_>> {
        let mut state = self.state.lock();
        if state.blocked {
            return None;
        }
        state.in_flight += 1;
        Some(OpGuard { list: self })
    }

    /// Drop the barrier and wait for in-flight operations to drain.
    pub async fn wait_and_block_ops(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                state.blocked = true;
                if state.in_flight == 0 {
                    return;
                }
            }
            notified.await;
        }
    }
}

pub(crate) struct OpGuard<'a> {
    list: &'a OpList,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.list.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 && state.blocked {
            self.list.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_barrier_waits_for_in_flight_ops() {
        let list = Arc::new(OpList::default());

        let guard_list = list.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard_list.begin().unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        // Give the op a moment to register.
        tokio::time::sleep(Duration::from_millis(10)).await;
        list.wait_and_block_ops().await;
        handle.await.unwrap();

        // New ops are refused once blocked.
        assert!(list.begin().is_none());
    }

    #[tokio::test]
    async fn test_barrier_with_no_ops_returns_immediately() {
        let list = OpList::default();
        list.wait_and_block_ops().await;
        assert!(list.begin().is_none());
    }
}
