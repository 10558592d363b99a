//! Lock mode algebra and non-blocking grants.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::lock::{LockError, LockGrant, LockManager, LockMode, LockTarget, LockWait};
    use crate::page::RowId;
    use std::sync::atomic::AtomicBool;

    use LockMode::*;

    const ALL: [LockMode; 4] = [IntentShared, IntentExclusive, Shared, Exclusive];

    /// # Scenario
    /// Every pair of modes.
    ///
    /// # Expected behavior
    /// Compatibility is symmetric and matches the multi-granularity matrix.
    #[test]
    fn lock_mode__compatibility_matrix() {
        let expected = [
            [true, true, true, false],
            [true, true, false, false],
            [true, false, true, false],
            [false, false, false, false],
        ];
        for (i, a) in ALL.iter().enumerate() {
            for (j, b) in ALL.iter().enumerate() {
                assert_eq!(a.compatible_with(*b), expected[i][j], "{a:?} vs {b:?}");
                assert_eq!(a.compatible_with(*b), b.compatible_with(*a));
            }
        }
    }

    /// # Scenario
    /// Supremum of each pair.
    ///
    /// # Expected behavior
    /// The result covers both inputs; `IX + S` is `X`.
    #[test]
    fn lock_mode__supremum_covers_both() {
        for a in ALL {
            for b in ALL {
                let s = a.supremum(b);
                assert!(s.covers(a) && s.covers(b), "{a:?} + {b:?} = {s:?}");
            }
        }
        assert_eq!(IntentExclusive.supremum(Shared), Exclusive);
        assert_eq!(IntentShared.supremum(Shared), Shared);
    }

    /// # Scenario
    /// One transaction requests S then S again, then X on the same row.
    ///
    /// # Expected behavior
    /// `Granted`, `AlreadyHeld`, then `Granted` as an upgrade to X.
    #[test]
    fn lock__reacquire_and_upgrade() {
        let lm = LockManager::new();
        let flag = AtomicBool::new(false);
        let row = LockTarget::Row(1, RowId(10));

        assert_eq!(lm.lock(1, row, Shared, LockWait::NoWait, &flag), Ok(LockGrant::Granted));
        assert_eq!(lm.lock(1, row, Shared, LockWait::NoWait, &flag), Ok(LockGrant::AlreadyHeld));
        assert_eq!(lm.lock(1, row, Exclusive, LockWait::NoWait, &flag), Ok(LockGrant::Granted));
        assert!(lm.holds(1, row, Exclusive));
        assert_eq!(lm.holders(row), vec![(1, Exclusive)]);
    }

    /// # Scenario
    /// Two readers share a row; a writer asks NOWAIT.
    ///
    /// # Expected behavior
    /// The writer gets `WouldBlock` until both readers release.
    #[test]
    fn lock__nowait_conflict_reports_would_block() {
        let lm = LockManager::new();
        let flag = AtomicBool::new(false);
        let row = LockTarget::Row(1, RowId(1));

        lm.lock(1, row, Shared, LockWait::NoWait, &flag).unwrap();
        lm.lock(2, row, Shared, LockWait::NoWait, &flag).unwrap();
        assert_eq!(
            lm.lock(3, row, Exclusive, LockWait::NoWait, &flag),
            Err(LockError::WouldBlock(row))
        );

        lm.unlock(1, row);
        assert!(lm.lock(3, row, Exclusive, LockWait::NoWait, &flag).is_err());
        lm.unlock_all(2);
        assert_eq!(lm.lock(3, row, Exclusive, LockWait::NoWait, &flag), Ok(LockGrant::Granted));
    }

    /// # Scenario
    /// IX on a table held by one transaction; another asks for table S.
    ///
    /// # Expected behavior
    /// S conflicts with IX; IS is still granted.
    #[test]
    fn lock__table_intent_modes() {
        let lm = LockManager::new();
        let flag = AtomicBool::new(false);
        let table = LockTarget::Table(7);

        lm.lock(1, table, IntentExclusive, LockWait::NoWait, &flag).unwrap();
        assert!(lm.lock(2, table, Shared, LockWait::NoWait, &flag).is_err());
        assert!(lm.lock(2, table, IntentShared, LockWait::NoWait, &flag).is_ok());
    }

    /// # Scenario
    /// Release everything for a transaction holding several locks.
    ///
    /// # Expected behavior
    /// No holders remain and the lock table is empty of waiters.
    #[test]
    fn lock__unlock_all_clears_holdings() {
        let lm = LockManager::new();
        let flag = AtomicBool::new(false);
        for r in 0..10 {
            lm.lock(5, LockTarget::Row(1, RowId(r)), Exclusive, LockWait::NoWait, &flag)
                .unwrap();
        }
        lm.unlock_all(5);
        for r in 0..10 {
            assert!(lm.holders(LockTarget::Row(1, RowId(r))).is_empty());
        }
        assert_eq!(lm.waiting_count(), 0);
    }
}
