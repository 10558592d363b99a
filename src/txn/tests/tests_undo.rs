//! Rollback through the undo log.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::btree::IndexKind;
    use crate::btree::tests::helpers::verify;
    use crate::engine::tests::helpers::*;
    use crate::scan::ScanSpec;
    use crate::txn::Isolation;

    /// # Scenario
    /// In one unit of work: insert a key, delete it again, delete a
    /// committed key, insert enough rows to split leaves. Then roll back.
    ///
    /// # Expected behavior
    /// Undo runs in reverse order and leaves exactly the committed rows,
    /// all live, in a valid tree.
    #[test]
    fn rollback__reverses_mixed_changes() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::NonUnique).unwrap();
        load(&engine, &index, 0..20);

        let txn = engine.begin(Isolation::ReadCommitted).unwrap();
        index.insert(&txn, &key(100)).unwrap();
        assert_eq!(index.delete(&txn, &key(100)).unwrap(), 1);
        assert_eq!(index.delete(&txn, &key(5)).unwrap(), 1);
        for i in 200..260 {
            index.insert(&txn, &key(i)).unwrap();
        }
        assert_eq!(verify(index.tree()), 81);

        txn.rollback().unwrap();
        assert_eq!(verify(index.tree()), 20);
        let stats = index.stats().unwrap();
        assert_eq!(stats.live_rows, 20);
        assert_eq!(stats.deleted_rows, 0);

        let mut scan = index.open_scan(&txn, ScanSpec::all()).unwrap();
        assert_eq!(drain_keys(&mut scan), (0..20).collect::<Vec<_>>());
    }

    /// # Scenario
    /// A commit after earlier work, then more work rolled back.
    ///
    /// # Expected behavior
    /// Rollback only touches the current unit of work.
    #[test]
    fn rollback__keeps_previously_committed_units() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();

        let txn = engine.begin(Isolation::ReadCommitted).unwrap();
        index.insert(&txn, &key(1)).unwrap();
        txn.commit().unwrap();
        index.insert(&txn, &key(2)).unwrap();
        index.delete(&txn, &key(1)).unwrap();
        txn.rollback().unwrap();

        let mut scan = index.open_scan(&txn, ScanSpec::all()).unwrap();
        assert_eq!(drain_keys(&mut scan), vec![1]);
    }

    /// # Scenario
    /// Uncommitted rows are inserted between committed ones, splitting
    /// most leaves, and compress runs before the rollback.
    ///
    /// # Expected behavior
    /// Undo finds its rows by descending again, wherever they ended up.
    #[test]
    fn rollback__finds_rows_after_structure_change() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();
        load(&engine, &index, (0..100).map(|i| i * 10));

        let txn = engine.begin(Isolation::ReadCommitted).unwrap();
        for i in 0..100 {
            index.insert(&txn, &key(i * 10 + 5)).unwrap();
        }
        index.compress().unwrap();
        assert_eq!(verify(index.tree()), 200);

        txn.rollback().unwrap();
        assert_eq!(verify(index.tree()), 100);
    }
}
