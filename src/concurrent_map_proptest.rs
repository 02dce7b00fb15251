#![cfg(test)]

// Property tests for ConcurrentMap kept inside the crate so they can use
// small shard counts and internal helpers without feature gates.

use crate::accessor::{Accessor, ConstAccessor};
use crate::concurrent_map::ConcurrentMap;
use crate::config::MapBuilder;
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Pool-indexed operations to improve shrinking: indices shrink to earlier keys,
// pool length shrinks, and op lists shrink in length.
#[derive(Clone, Debug)]
enum OpI {
    Insert(usize, i32),
    InsertConst(usize, i32),
    InsertEntry(usize, i32),
    Find(usize),
    Mutate(usize, i32),
    EraseKey(usize),
    EraseBound(usize),
    Contains(String),
    Walk,
}

fn key_from(pool: &[String], i: usize) -> Key {
    Key(pool[i].clone())
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, usize, Vec<OpI>)> {
    (proptest::collection::vec("[a-z]{0,5}", 1..=8), 0u32..4).prop_flat_map(|(pool, shard_bits)| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::Insert(i, v)),
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::InsertConst(i, v)),
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::InsertEntry(i, v)),
            idx.clone().prop_map(OpI::Find),
            (idx.clone(), any::<i32>()).prop_map(|(i, d)| OpI::Mutate(i, d)),
            idx.clone().prop_map(OpI::EraseKey),
            idx.clone().prop_map(OpI::EraseBound),
            prop_oneof![
                contains_pool.prop_map(|s: String| s),
                "[a-z]{0,5}".prop_map(|s| s)
            ]
            .prop_map(OpI::Contains),
            Just(OpI::Walk),
        ];
        proptest::collection::vec(op, 1..60)
            .prop_map(move |ops| (pool.clone(), 1usize << shard_bits, ops))
    })
}

// Property: State-machine equivalence against std::collections::HashMap.
// Invariants exercised across random operation sequences:
// - `insert` reports creation iff the key was absent; an existing value is
//   never overwritten and the accessor observes the stored value.
// - `find` binds iff the key is present and observes the model's value.
// - Mutation through a bound `Accessor` is visible to later lookups.
// - `erase_key` and `erase` remove exactly the bound/named entry.
// - `for_each` visits each live entry exactly once.
// - `len`/`is_empty` parity with the model after each op.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, shards, ops) in arb_scenario()) {
        let sut: ConcurrentMap<Key, i32> = MapBuilder::new().shards(shards).build().unwrap();
        let mut model: HashMap<Key, i32> = HashMap::new();

        for op in ops {
            match op {
                OpI::Insert(i, v) => {
                    let k = key_from(&pool, i);
                    let mut acc = Accessor::new();
                    let created = sut.insert(&mut acc, k.clone(), v);
                    prop_assert_eq!(created, !model.contains_key(&k));
                    let stored = *model.entry(k.clone()).or_insert(v);
                    prop_assert_eq!(acc.key(), Some(&k));
                    prop_assert_eq!(acc.value(), Some(&stored));
                }
                OpI::InsertConst(i, v) => {
                    let k = key_from(&pool, i);
                    let mut acc = ConstAccessor::new();
                    let created = sut.insert(&mut acc, k.clone(), v);
                    prop_assert_eq!(created, !model.contains_key(&k));
                    let stored = *model.entry(k).or_insert(v);
                    prop_assert_eq!(acc.value(), Some(&stored));
                }
                OpI::InsertEntry(i, v) => {
                    let k = key_from(&pool, i);
                    let created = sut.insert_entry(k.clone(), v);
                    prop_assert_eq!(created, !model.contains_key(&k));
                    model.entry(k).or_insert(v);
                }
                OpI::Find(i) => {
                    let k = key_from(&pool, i);
                    let mut acc = ConstAccessor::new();
                    let found = sut.find(&mut acc, k.0.as_str());
                    prop_assert_eq!(found, model.contains_key(&k));
                    prop_assert_eq!(acc.value(), model.get(&k));
                }
                OpI::Mutate(i, d) => {
                    let k = key_from(&pool, i);
                    let mut acc = Accessor::new();
                    if sut.find(&mut acc, &k) {
                        let v = acc.value_mut().unwrap();
                        *v = v.wrapping_add(d);
                        let mv = model.get_mut(&k).unwrap();
                        *mv = mv.wrapping_add(d);
                    } else {
                        prop_assert!(!model.contains_key(&k));
                    }
                }
                OpI::EraseKey(i) => {
                    let k = key_from(&pool, i);
                    let removed = sut.erase_key(k.0.as_str());
                    prop_assert_eq!(removed, model.remove(&k).is_some());
                }
                OpI::EraseBound(i) => {
                    let k = key_from(&pool, i);
                    let mut acc = Accessor::new();
                    if sut.find(&mut acc, &k) {
                        prop_assert!(sut.erase(&mut acc));
                        prop_assert!(!acc.is_bound());
                        prop_assert!(model.remove(&k).is_some());
                    } else {
                        prop_assert!(!sut.erase(&mut acc));
                    }
                }
                OpI::Contains(s) => {
                    prop_assert_eq!(sut.contains_key(s.as_str()), model.contains_key(s.as_str()));
                }
                OpI::Walk => {
                    let mut seen: BTreeMap<Key, i32> = BTreeMap::new();
                    sut.for_each(|k, v| {
                        assert!(seen.insert(k.clone(), *v).is_none(), "visited twice");
                    });
                    let expected: BTreeMap<Key, i32> =
                        model.iter().map(|(k, v)| (k.clone(), *v)).collect();
                    prop_assert_eq!(seen, expected);
                }
            }
            prop_assert_eq!(sut.len(), model.len());
            prop_assert_eq!(sut.is_empty(), model.is_empty());
        }
    }
}
