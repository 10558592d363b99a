//! Index registry, id allocation and lifecycle.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::btree::IndexKind;
    use crate::engine::EngineError;
    use crate::engine::tests::helpers::*;
    use crate::page::RowId;
    use crate::txn::Isolation;

    /// # Scenario
    /// Create two indexes, look one up, create a duplicate name, look up
    /// a missing name.
    ///
    /// # Expected behavior
    /// Lookups share the same tree; the duplicate and the missing name
    /// fail with typed errors; names are listed sorted.
    #[test]
    fn registry__create_lookup_and_errors() {
        let engine = small_engine();
        let a = engine.create_index("b_idx", IndexKind::Unique).unwrap();
        engine.create_index("a_idx", IndexKind::NonUnique).unwrap();

        let again = engine.index("b_idx").unwrap();
        assert!(std::sync::Arc::ptr_eq(a.tree(), again.tree()));
        assert_eq!(again.kind(), IndexKind::Unique);

        assert!(matches!(
            engine.create_index("b_idx", IndexKind::NonUnique),
            Err(EngineError::IndexExists(name)) if name == "b_idx"
        ));
        assert!(matches!(
            engine.index("missing"),
            Err(EngineError::IndexNotFound(_))
        ));
        assert_eq!(engine.index_names(), vec!["a_idx".to_string(), "b_idx".to_string()]);
    }

    /// # Scenario
    /// Two indexes are created.
    ///
    /// # Expected behavior
    /// They get distinct table ids so their locks never collide.
    #[test]
    fn registry__distinct_table_ids() {
        let engine = small_engine();
        let a = engine.create_index("a", IndexKind::Unique).unwrap();
        let b = engine.create_index("b", IndexKind::Unique).unwrap();
        assert_ne!(a.tree().table_id(), b.tree().table_id());
    }

    /// # Scenario
    /// Row ids are allocated, then the allocator is told about a larger id.
    ///
    /// # Expected behavior
    /// Ids strictly increase and never fall back below an observed id.
    #[test]
    fn ids__increase_and_respect_observed() {
        let engine = small_engine();
        let a = engine.next_row_id();
        let b = engine.next_row_id();
        assert!(b > a);

        engine.observe_row_id(RowId(1_000));
        assert!(engine.next_row_id() > RowId(1_000));

        engine.observe_row_id(RowId(5));
        assert!(engine.next_row_id() > RowId(1_000));
    }

    /// # Scenario
    /// The engine is closed twice, then used.
    ///
    /// # Expected behavior
    /// Close is idempotent; creating indexes or transactions fails with
    /// `Closed`.
    #[test]
    fn close__idempotent_and_rejects_new_work() {
        let engine = small_engine();
        engine.close();
        engine.close();
        assert!(engine.is_closed());
        assert!(matches!(
            engine.create_index("x", IndexKind::Unique),
            Err(EngineError::Closed)
        ));
        assert!(matches!(
            engine.begin(Isolation::ReadCommitted),
            Err(EngineError::Closed)
        ));
    }

    /// # Scenario
    /// A system transaction takes a lock, and the closure returns.
    ///
    /// # Expected behavior
    /// The lock is released when the system transaction ends.
    #[test]
    fn system_txn__releases_locks() {
        use crate::lock::{LockMode, LockTarget};

        let engine = small_engine();
        let target = LockTarget::Table(42);
        let id = engine.with_system_txn(|ctx| {
            ctx.lock_wait(target, LockMode::Exclusive).unwrap();
            assert!(engine.locks().holds(ctx.id, target, LockMode::Exclusive));
            ctx.id
        });
        assert!(!engine.locks().holds(id, target, LockMode::Exclusive));
        assert!(engine.locks().holders(target).is_empty());
    }
}
