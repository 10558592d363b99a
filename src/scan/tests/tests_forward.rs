//! Start and stop positions, qualifiers, batches and cursor state.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::btree::IndexKind;
    use crate::engine::tests::helpers::*;
    use crate::page::RowId;
    use crate::scan::{CompareOp, Qualifier, ScanError, ScanSpec, ScanStart, ScanState, ScanStop};
    use crate::txn::Isolation;

    /// # Scenario
    /// Keys 0..50 across several leaves, scanned with each kind of
    /// start and stop bound.
    ///
    /// # Expected behavior
    /// Inclusive and exclusive bounds are honoured on both ends.
    #[test]
    fn forward__start_and_stop_bounds() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();
        load(&engine, &index, 0..50);
        let txn = engine.begin(Isolation::ReadCommitted).unwrap();

        let spec = ScanSpec::all()
            .start(ScanStart::AtOrAfter(key(10).to_vec()))
            .stop(ScanStop::Before(key(20).to_vec()));
        let mut scan = index.open_scan(&txn, spec).unwrap();
        assert_eq!(drain_keys(&mut scan), (10..20).collect::<Vec<_>>());

        let spec = ScanSpec::all()
            .start(ScanStart::After(key(10).to_vec()))
            .stop(ScanStop::AtOrBefore(key(20).to_vec()));
        let mut scan = index.open_scan(&txn, spec).unwrap();
        assert_eq!(drain_keys(&mut scan), (11..=20).collect::<Vec<_>>());

        let spec = ScanSpec::all().start(ScanStart::After(key(45).to_vec()));
        let mut scan = index.open_scan(&txn, spec).unwrap();
        assert_eq!(drain_keys(&mut scan), vec![46, 47, 48, 49]);

        let spec = ScanSpec::all().stop(ScanStop::Before(key(0).to_vec()));
        let mut scan = index.open_scan(&txn, spec).unwrap();
        assert!(drain_keys(&mut scan).is_empty());
        assert_eq!(scan.state(), ScanState::Done);
    }

    /// # Scenario
    /// Non-unique index with three duplicates of key 7 and a scan for
    /// exactly that key.
    ///
    /// # Expected behavior
    /// All three, in row id order.
    #[test]
    fn forward__exact_key_returns_all_duplicates() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::NonUnique).unwrap();
        load(&engine, &index, 0..30);
        let dups = load(&engine, &index, [7, 7]);

        let txn = engine.begin(Isolation::ReadCommitted).unwrap();
        let mut scan = index.open_scan(&txn, ScanSpec::key(&key(7))).unwrap();
        let mut rows = Vec::new();
        while let Some(row) = scan.fetch_next().unwrap() {
            assert_eq!(key_of(&row), 7);
            rows.push(row.row);
        }
        // Key 7 was the eighth row loaded.
        assert_eq!(rows, vec![RowId(8), dups[0], dups[1]]);
    }

    /// # Scenario
    /// Qualifiers that exclude some keys inside the scanned range.
    ///
    /// # Expected behavior
    /// Only rows matching every qualifier are returned.
    #[test]
    fn forward__qualifiers_filter_rows() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();
        load(&engine, &index, 0..40);
        let txn = engine.begin(Isolation::ReadCommitted).unwrap();

        let spec = ScanSpec::all()
            .qualify(Qualifier::new(CompareOp::Ge, key(30)))
            .qualify(Qualifier::new(CompareOp::Ne, key(33)));
        let mut scan = index.open_scan(&txn, spec).unwrap();
        assert_eq!(drain_keys(&mut scan), vec![30, 31, 32, 34, 35, 36, 37, 38, 39]);

        assert!(Qualifier::new(CompareOp::Lt, b"b".to_vec()).matches(b"a"));
        assert!(!Qualifier::new(CompareOp::Gt, b"b".to_vec()).matches(b"b"));
        assert!(Qualifier::new(CompareOp::Le, b"b".to_vec()).matches(b"b"));
        assert!(Qualifier::new(CompareOp::Eq, b"b".to_vec()).matches(b"b"));
    }

    /// # Scenario
    /// Committed deletes that have not been purged yet.
    ///
    /// # Expected behavior
    /// The scan skips delete-marked entries.
    #[test]
    fn forward__skips_deleted_entries() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();
        load(&engine, &index, 0..20);
        delete(&engine, &index, (0..20).filter(|i| i % 3 == 0));

        let txn = engine.begin(Isolation::RepeatableRead).unwrap();
        let mut scan = index.open_scan(&txn, ScanSpec::all()).unwrap();
        assert_eq!(
            drain_keys(&mut scan),
            (0..20).filter(|i| i % 3 != 0).collect::<Vec<_>>()
        );
    }

    /// # Scenario
    /// 100 rows fetched in batches of 7.
    ///
    /// # Expected behavior
    /// Batches are full until the last one, then an empty batch signals
    /// the end.
    #[test]
    fn forward__batches_cover_every_row() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();
        load(&engine, &index, 0..100);
        let txn = engine.begin(Isolation::ReadCommitted).unwrap();

        let mut scan = index.open_scan(&txn, ScanSpec::all()).unwrap();
        let mut got = Vec::new();
        loop {
            let batch = scan.fetch_next_batch(7).unwrap();
            if batch.is_empty() {
                break;
            }
            assert!(batch.len() == 7 || got.len() + batch.len() == 100);
            got.extend(batch.iter().map(key_of));
        }
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        assert_eq!(scan.stats().rows_returned, 100);
        assert!(scan.stats().pages_visited > 1);
    }

    /// # Scenario
    /// A scan is closed, then fetched from.
    ///
    /// # Expected behavior
    /// `NoCurrentCursor`; closing twice is harmless.
    #[test]
    fn forward__closed_scan_has_no_cursor() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();
        load(&engine, &index, 0..5);
        let txn = engine.begin(Isolation::ReadCommitted).unwrap();

        let mut scan = index.open_scan(&txn, ScanSpec::all()).unwrap();
        assert!(scan.fetch_next().unwrap().is_some());
        scan.close();
        scan.close();
        assert_eq!(scan.state(), ScanState::Closed);
        assert_eq!(scan.fetch_next(), Err(ScanError::NoCurrentCursor));
        assert_eq!(scan.fetch_next_batch(3), Err(ScanError::NoCurrentCursor));
    }

    /// # Scenario
    /// The transaction commits while a non-holdable and a holdable scan
    /// are both open mid-way.
    ///
    /// # Expected behavior
    /// The non-holdable scan reports `NoCurrentCursor`; the holdable one
    /// carries on where it stopped.
    #[test]
    fn forward__commit_ends_non_holdable_scans() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();
        load(&engine, &index, 0..10);
        let txn = engine.begin(Isolation::ReadCommitted).unwrap();

        let mut plain = index.open_scan(&txn, ScanSpec::all()).unwrap();
        let mut held = index.open_scan(&txn, ScanSpec::all().holdable(true)).unwrap();
        assert_eq!(key_of(&plain.fetch_next().unwrap().unwrap()), 0);
        assert_eq!(key_of(&held.fetch_next().unwrap().unwrap()), 0);

        txn.commit().unwrap();
        assert_eq!(plain.fetch_next(), Err(ScanError::NoCurrentCursor));
        assert_eq!(drain_keys(&mut held), (1..10).collect::<Vec<_>>());
    }

    /// # Scenario
    /// A read-uncommitted scan while another transaction holds an
    /// uncommitted insert.
    ///
    /// # Expected behavior
    /// The scan takes no locks, does not block and sees the new row.
    #[test]
    fn forward__read_uncommitted_sees_pending_insert() {
        let engine = small_engine();
        let index = engine.create_index("idx", IndexKind::Unique).unwrap();
        load(&engine, &index, [1, 3]);

        let writer = engine.begin(Isolation::ReadCommitted).unwrap();
        index.insert(&writer, &key(2)).unwrap();

        let reader = engine.begin(Isolation::ReadUncommitted).unwrap();
        let mut scan = index.open_scan(&reader, ScanSpec::all()).unwrap();
        assert_eq!(drain_keys(&mut scan), vec![1, 2, 3]);
        assert_eq!(scan.stats().lock_waits, 0);
        writer.rollback().unwrap();
    }
}
