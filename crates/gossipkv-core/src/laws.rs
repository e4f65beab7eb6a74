//! Property checks of the merge laws for every built-in codec

use crate::codec::{Codec, Mergeable};
use crate::codecs::*;
use crate::registry::CodecRegistry;
use crate::types::{CodecId, Value};
use proptest::prelude::*;
use std::sync::Arc;

fn codec(id: CodecId) -> Arc<dyn Codec> {
    CodecRegistry::with_builtin().lookup(id).unwrap()
}

/// Merge through the dynamic codec interface, as the store does
fn merged<T: Mergeable>(codec: &dyn Codec, local: &T, remote: &T) -> T {
    let out = codec
        .merge(&Value::new(local.clone()), &Value::new(remote.clone()))
        .unwrap();
    match out {
        Some(value) => value.downcast_ref::<T>().unwrap().clone(),
        None => local.clone(),
    }
}

fn check_laws<T: Mergeable + PartialEq>(codec: &dyn Codec, a: &T, b: &T, c: &T) -> Result<(), TestCaseError> {
    // commutative
    let ab = merged(codec, a, b);
    prop_assert_eq!(&ab, &merged(codec, b, a));

    // idempotent, and a repeated merge reports no change
    prop_assert_eq!(&merged(codec, &ab, b), &ab);
    let again = codec
        .merge(&Value::new(ab.clone()), &Value::new(b.clone()))
        .unwrap();
    prop_assert!(again.is_none());

    // associative
    let left = merged(codec, &ab, c);
    let right = merged(codec, a, &merged(codec, b, c));
    prop_assert_eq!(left, right);

    // survives the wire
    let bytes = codec.encode(&Value::new(ab.clone())).unwrap();
    let decoded = codec.decode(&bytes).unwrap();
    prop_assert_eq!(decoded.downcast_ref::<T>(), Some(&ab));
    Ok(())
}

fn max_counter() -> impl Strategy<Value = MaxCounter> {
    any::<u64>().prop_map(MaxCounter)
}

fn g_counter() -> impl Strategy<Value = GCounter> {
    prop::collection::vec(("n[0-3]", 0u64..100), 0..6).prop_map(|slots| {
        let mut counter = GCounter::default();
        for (node, by) in slots {
            counter.increment(&node, by);
        }
        counter
    })
}

fn lww_register() -> impl Strategy<Value = LwwRegister> {
    (0u64..4, "n[0-2]", prop::collection::vec(any::<u8>(), 0..3))
        .prop_map(|(ts, node, value)| LwwRegister::new(value, ts, node))
}

fn lww_map() -> impl Strategy<Value = LwwMap> {
    let op = (
        "f[0-2]",
        0u64..4,
        "n[0-2]",
        prop::option::of(prop::collection::vec(any::<u8>(), 0..3)),
    );
    prop::collection::vec(op, 0..6).prop_map(|ops| {
        let mut map = LwwMap::default();
        for (field, ts, node, value) in ops {
            match value {
                Some(v) => map.insert(field, v, ts, node),
                None => map.remove(field, ts, node),
            };
        }
        map
    })
}

proptest! {
    #[test]
    fn max_counter_laws(a in max_counter(), b in max_counter(), c in max_counter()) {
        check_laws(codec(MAX_COUNTER).as_ref(), &a, &b, &c)?;
    }

    #[test]
    fn g_counter_laws(a in g_counter(), b in g_counter(), c in g_counter()) {
        check_laws(codec(G_COUNTER).as_ref(), &a, &b, &c)?;
    }

    #[test]
    fn lww_register_laws(a in lww_register(), b in lww_register(), c in lww_register()) {
        check_laws(codec(LWW_REGISTER).as_ref(), &a, &b, &c)?;
    }

    #[test]
    fn lww_map_laws(a in lww_map(), b in lww_map(), c in lww_map()) {
        check_laws(codec(LWW_MAP).as_ref(), &a, &b, &c)?;
    }
}
