//! Persistence properties for the file-backed table.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tempfile::tempdir;
use tidesync_store::{FileTable, KeyValueTable};

#[derive(Debug, Clone)]
enum Op {
    Put(String, Vec<u8>),
    Delete(String),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = "[a-f]{1,4}";
    prop_oneof![
        (key, proptest::collection::vec(any::<u8>(), 0..32))
            .prop_map(|(k, v)| Op::Put(k, v)),
        key.prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replaying the log after reopen yields exactly the state a plain
    /// map would have reached applying the same operations.
    #[test]
    fn reopen_matches_model(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.log");
        let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        {
            let table = FileTable::open(&path).unwrap();
            for op in &ops {
                match op {
                    Op::Put(k, v) => {
                        table.put(k, v).unwrap();
                        model.insert(k.clone(), v.clone());
                    }
                    Op::Delete(k) => {
                        table.delete(k).unwrap();
                        model.remove(k);
                    }
                }
            }
        }

        let table = FileTable::open(&path).unwrap();
        let entries: BTreeMap<String, Vec<u8>> =
            table.scan().unwrap().into_iter().collect();
        prop_assert_eq!(entries, model);
    }
}
