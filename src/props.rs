//! Shared test constructors and proptest strategies.

use crate::item::{Header, Id, Item, Perspective, Version};
use bson::Document;
use proptest::prelude::*;

pub fn id(s: &str) -> Id {
    Id::new(s.as_bytes()).unwrap()
}

pub fn version(bytes: &[u8]) -> Version {
    Version::new(bytes).unwrap()
}

pub fn perspective(s: &str) -> Perspective {
    s.parse().unwrap()
}

/// An item on perspective `I`.
pub fn item(id_: &str, v: &[u8], parents: &[&[u8]], body: Document) -> Item {
    let mut header = Header::new(id(id_), perspective("I"));
    header.version = Some(version(v));
    header.parents = parents.iter().map(|p| version(p)).collect();
    Item::new(header, body)
}

/// A virtual merge: parents only, no version.
pub fn virtual_item(id_: &str, parents: &[&[u8]]) -> Item {
    let mut header = Header::new(id(id_), perspective("I"));
    header.parents = parents.iter().map(|p| version(p)).collect();
    Item::new(header, Document::new())
}

pub fn arb_id() -> impl Strategy<Value = Id> {
    "[a-z]{1,8}".prop_map(|s| Id::new(s.into_bytes()).unwrap())
}

pub fn arb_version() -> impl Strategy<Value = Version> {
    proptest::collection::vec(any::<u8>(), 1..=6).prop_map(|b| Version::new(&b).unwrap())
}

pub fn arb_body() -> impl Strategy<Value = Document> {
    proptest::collection::btree_map("[a-z]{1,4}", any::<i64>(), 0..5).prop_map(|attrs| {
        let mut body = Document::new();
        for (k, v) in attrs {
            body.insert(k, v);
        }
        body
    })
}

pub fn arb_item() -> impl Strategy<Value = Item> {
    (arb_id(), arb_version(), arb_body()).prop_map(|(id, version, body)| {
        let mut header = Header::new(id, perspective("I"));
        header.version = Some(version);
        Item::new(header, body)
    })
}

mod laws {
    use super::*;
    use crate::merge::merge3;
    use crate::tree::{Tree, TreeOptions};

    proptest! {
        /// merge3(x, x, x) = x
        #[test]
        fn merge_is_reflexive(x in arb_item()) {
            let merged = merge3(&x, &x, &x, None).unwrap();
            prop_assert_eq!(&merged.body, &x.body);
            prop_assert_eq!(merged.header.deleted, x.header.deleted);
        }

        /// merge3(x, y, lca) = merge3(y, x, lca) up to parent order
        #[test]
        fn merge_is_commutative(
            lca_body in arb_body(),
            x_body in arb_body(),
            y_body in arb_body(),
        ) {
            let lca = item("x", b"aaaaaa", &[], lca_body);
            let x = item("x", b"bbbbbb", &[b"aaaaaa"], x_body);
            let y = item("x", b"cccccc", &[b"aaaaaa"], y_body);
            let xy = merge3(&x, &y, &lca, None);
            let yx = merge3(&y, &x, &lca, None);
            match (xy, yx) {
                (Ok(xy), Ok(yx)) => prop_assert_eq!(xy.body, yx.body),
                (Err(xy), Err(yx)) => prop_assert_eq!(xy.to_string(), yx.to_string()),
                (xy, yx) => prop_assert!(false, "one side conflicted: {:?} vs {:?}", xy, yx),
            }
        }

        /// writing the same item twice leaves the tree unchanged
        #[test]
        fn writes_are_idempotent(it in arb_item()) {
            let db = sled::Config::new().temporary(true).open().unwrap();
            let tree = Tree::open(db.open_tree("store").unwrap(), "I", &TreeOptions::default()).unwrap();
            let first = tree.write(&it).unwrap();
            let stats = tree.stats().unwrap();
            let second = tree.write(&it).unwrap();
            prop_assert_eq!(first, second);
            prop_assert_eq!(stats, tree.stats().unwrap());
        }

        /// the content version only depends on canonical content
        #[test]
        fn content_versions_are_deterministic(it in arb_item()) {
            let mut shuffled = it.clone();
            shuffled.header.index = Some(99);
            shuffled.meta.ack = true;
            prop_assert_eq!(it.content_version(6), shuffled.content_version(6));
        }

        /// insertion indices are strictly increasing with insertion order
        #[test]
        fn insertion_indices_increase(bodies in proptest::collection::vec(arb_body(), 1..8)) {
            let db = sled::Config::new().temporary(true).open().unwrap();
            let tree = Tree::open(db.open_tree("store").unwrap(), "I", &TreeOptions::default()).unwrap();
            let mut parent: Option<Version> = None;
            let mut last_index = None;
            for (n, body) in bodies.into_iter().enumerate() {
                let mut header = Header::new(id("x"), perspective("I"));
                header.version = Some(version(format!("v{:05}", n).as_bytes()));
                header.parents = parent.iter().cloned().collect();
                let stored = tree.write(&Item::new(header, body)).unwrap();
                prop_assert!(stored.header.index > last_index);
                last_index = stored.header.index;
                parent = stored.header.version;
            }
        }
    }
}
