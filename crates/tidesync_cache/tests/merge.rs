//! Merge properties across cache implementations.

use proptest::prelude::*;
use std::sync::Arc;
use tidesync_cache::{FieldValue, MemoryCache, NormalizedCache, Record, RecordSet, TableCache};
use tidesync_store::MemoryTable;

fn value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Null),
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i64>().prop_map(FieldValue::Int),
        "[a-z]{0,6}".prop_map(FieldValue::from),
        "[a-z]{1,4}\\.[a-z]{1,4}".prop_map(FieldValue::reference),
    ]
}

fn record_set_strategy() -> impl Strategy<Value = RecordSet> {
    proptest::collection::btree_map(
        "[a-z]{1,4}(\\.[a-z]{1,4}){0,2}",
        proptest::collection::btree_map("[a-z]{1,3}", value_strategy(), 1..4),
        1..6,
    )
    .prop_map(|records| {
        records
            .into_iter()
            .map(|(key, fields)| (key, fields.into_iter().collect::<Record>()))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Merging the same record set twice yields the same stored state
    /// and an empty change set the second time.
    #[test]
    fn merge_is_idempotent(set in record_set_strategy()) {
        let cache = MemoryCache::new();
        let first = cache.merge(set.clone()).unwrap();
        let second = cache.merge(set.clone()).unwrap();

        prop_assert!(!first.is_empty());
        prop_assert!(second.is_empty());
    }

    /// Memory and table-backed caches agree on merge results.
    #[test]
    fn implementations_agree(a in record_set_strategy(), b in record_set_strategy()) {
        let memory = MemoryCache::new();
        let table = TableCache::open(Arc::new(MemoryTable::new())).unwrap();

        let m1 = memory.merge(a.clone()).unwrap();
        let t1 = table.merge(a.clone()).unwrap();
        prop_assert_eq!(m1, t1);

        let m2 = memory.merge(b.clone()).unwrap();
        let t2 = table.merge(b).unwrap();
        prop_assert_eq!(m2, t2);

        let keys: Vec<String> = a.iter().map(|(k, _)| k.clone()).collect();
        prop_assert_eq!(memory.load(&keys).unwrap(), table.load(&keys).unwrap());
    }
}
