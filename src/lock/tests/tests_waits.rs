//! Blocking lock requests: grant after wait, timeout, deadlock, interrupt.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::lock::{LockError, LockGrant, LockManager, LockMode, LockTarget, LockWait};
    use crate::page::RowId;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for_waiters(lm: &LockManager, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while lm.waiting_count() < n {
            assert!(Instant::now() < deadline, "waiter never queued");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// # Scenario
    /// T1 holds X; T2 waits with a generous timeout; T1 releases.
    ///
    /// # Expected behavior
    /// T2 receives `GrantedAfterWait`.
    #[test]
    fn lock__granted_after_wait() {
        let lm = Arc::new(LockManager::new());
        let row = LockTarget::Row(1, RowId(800));
        let flag = Arc::new(AtomicBool::new(false));
        lm.lock(1, row, LockMode::Exclusive, LockWait::NoWait, &flag).unwrap();

        let lm2 = Arc::clone(&lm);
        let flag2 = Arc::clone(&flag);
        let waiter = thread::spawn(move || {
            lm2.lock(2, row, LockMode::Shared, LockWait::Timeout(Duration::from_secs(5)), &flag2)
        });

        wait_for_waiters(&lm, 1);
        lm.unlock_all(1);

        assert_eq!(waiter.join().unwrap(), Ok(LockGrant::GrantedAfterWait));
        assert_eq!(lm.waiting_count(), 0);
    }

    /// # Scenario
    /// T1 holds X and never releases; T2 waits 40ms.
    ///
    /// # Expected behavior
    /// T2 fails with `Timeout` and is no longer queued.
    #[test]
    fn lock__bounded_wait_times_out() {
        let lm = LockManager::new();
        let flag = AtomicBool::new(false);
        let row = LockTarget::Row(1, RowId(1));
        lm.lock(1, row, LockMode::Exclusive, LockWait::NoWait, &flag).unwrap();

        let res = lm.lock(2, row, LockMode::Shared, LockWait::Timeout(Duration::from_millis(40)), &flag);
        match res {
            Err(LockError::Timeout { target, waited }) => {
                assert_eq!(target, row);
                assert!(waited >= Duration::from_millis(40));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(lm.waiting_count(), 0);
    }

    /// # Scenario
    /// T1 holds A and waits for B; T2 holds B and then asks for A.
    ///
    /// # Expected behavior
    /// Exactly one of them fails with `Deadlock`; after the victim
    /// releases, the survivor is granted.
    #[test]
    fn lock__deadlock_detected_for_one_participant() {
        let lm = Arc::new(LockManager::new());
        let a = LockTarget::Row(1, RowId(1));
        let b = LockTarget::Row(1, RowId(2));
        let flag = Arc::new(AtomicBool::new(false));
        let wait = LockWait::Timeout(Duration::from_secs(5));

        lm.lock(1, a, LockMode::Exclusive, LockWait::NoWait, &flag).unwrap();
        lm.lock(2, b, LockMode::Exclusive, LockWait::NoWait, &flag).unwrap();

        let spawn = |txn: u64, target: LockTarget| {
            let lm = Arc::clone(&lm);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let res = lm.lock(txn, target, LockMode::Exclusive, wait, &flag);
                if res.is_err() {
                    lm.unlock_all(txn);
                }
                res
            })
        };

        let t1 = spawn(1, b);
        wait_for_waiters(&lm, 1);
        let t2 = spawn(2, a);

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();

        let deadlocks = [&r1, &r2]
            .iter()
            .filter(|r| matches!(r, Err(LockError::Deadlock(_))))
            .count();
        assert_eq!(deadlocks, 1, "r1={r1:?} r2={r2:?}");
        assert!(r1.is_ok() || r2.is_ok());
    }

    /// # Scenario
    /// T2 blocks on a lock with a long timeout; its interrupt flag is raised.
    ///
    /// # Expected behavior
    /// T2 fails with `Interrupted` promptly.
    #[test]
    fn lock__interrupt_wakes_waiter() {
        let lm = Arc::new(LockManager::new());
        let row = LockTarget::Row(1, RowId(3));
        let holder_flag = AtomicBool::new(false);
        lm.lock(1, row, LockMode::Exclusive, LockWait::NoWait, &holder_flag).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let lm2 = Arc::clone(&lm);
        let flag2 = Arc::clone(&flag);
        let started = Instant::now();
        let waiter = thread::spawn(move || {
            lm2.lock(2, row, LockMode::Shared, LockWait::Timeout(Duration::from_secs(30)), &flag2)
        });

        wait_for_waiters(&lm, 1);
        flag.store(true, Ordering::Release);

        assert_eq!(waiter.join().unwrap(), Err(LockError::Interrupted(row)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(lm.waiting_count(), 0);
    }

    /// # Scenario
    /// A reader waits behind a writer; a second reader arrives later.
    ///
    /// # Expected behavior
    /// The late reader queues behind the waiting writer instead of
    /// overtaking it (FIFO).
    #[test]
    fn lock__fifo_prevents_overtaking() {
        let lm = Arc::new(LockManager::new());
        let row = LockTarget::Row(1, RowId(9));
        let flag = Arc::new(AtomicBool::new(false));
        lm.lock(1, row, LockMode::Shared, LockWait::NoWait, &flag).unwrap();

        let lm2 = Arc::clone(&lm);
        let flag2 = Arc::clone(&flag);
        let writer = thread::spawn(move || {
            lm2.lock(2, row, LockMode::Exclusive, LockWait::Timeout(Duration::from_secs(5)), &flag2)
        });
        wait_for_waiters(&lm, 1);

        assert_eq!(
            lm.lock(3, row, LockMode::Shared, LockWait::NoWait, &flag),
            Err(LockError::WouldBlock(row))
        );

        lm.unlock_all(1);
        assert_eq!(writer.join().unwrap(), Ok(LockGrant::GrantedAfterWait));
    }
}
