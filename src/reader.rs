//! Tailable streaming reader.
//!
//! Emits a filtered, hook transformed, connected projection of one tree from
//! an offset version, in insertion order. Versions that fail the filter (or
//! are dropped by a hook) are not emitted; instead they are represented by
//! their nearest filter matching ancestors, so the parent links of emitted
//! items always form a connected subgraph.

use crate::error::Error;
use crate::item::{Item, Version};
use crate::tree::Tree;
use anyhow::Result;
use bson::Document;
use futures::{Future, Stream};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A transform on the reader's output. Returning `None` drops the item, as
/// if the filter had rejected it.
pub type Hook = Box<dyn FnMut(Item, &Document) -> Result<Option<Item>> + Send>;

/// Reader configuration.
pub struct ReaderOptions {
    /// Suppress emission until this version is seen. The offset item itself
    /// is emitted.
    pub offset: Option<Version>,
    /// Attribute equality predicate over the item body.
    pub filter: Option<Document>,
    /// Transforms run in order on every filter matching item.
    pub hooks: Vec<Hook>,
    /// Opaque options passed to every hook invocation.
    pub hook_opts: Document,
    /// Tail the tree instead of ending at the current last item.
    pub follow: bool,
    /// Emit encoded BSON instead of parsed documents.
    pub raw: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            offset: None,
            filter: None,
            hooks: Vec::new(),
            hook_opts: Document::new(),
            follow: false,
            raw: false,
        }
    }
}

/// One emitted element.
#[derive(Clone, Debug, PartialEq)]
pub enum Emitted {
    Parsed(Document),
    Raw(Vec<u8>),
}

impl Emitted {
    pub fn as_doc(&self) -> Option<&Document> {
        match self {
            Self::Parsed(doc) => Some(doc),
            Self::Raw(_) => None,
        }
    }
}

#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Clonable handle to stop a running [`Reader`].
#[derive(Clone)]
pub struct ReaderHandle(Arc<Shared>);

impl ReaderHandle {
    /// Stops the reader; in-flight work is drained and the stream ends.
    /// Closing twice is fine.
    pub fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        if let Some(waker) = self.0.waker.lock().expect("waker lock").take() {
            waker.wake();
        }
    }
}

/// Lazy, optionally tailing stream over one tree.
pub struct Reader {
    tree: Tree,
    offset: Option<Version>,
    filter: Option<Document>,
    hooks: Vec<Hook>,
    hook_opts: Document,
    follow: bool,
    raw: bool,
    subscriber: Option<sled::Subscriber>,
    shared: Arc<Shared>,
    /// total item count at stream start, bounds the offset search
    total: u64,
    scanned: u64,
    offset_seen: bool,
    last_index: Option<u64>,
    repr: HashMap<Version, Vec<Version>>,
    done: bool,
}

impl Reader {
    pub fn new(tree: &Tree, opts: ReaderOptions) -> Result<Self> {
        // subscribe before the catch-up scan so nothing is missed
        let subscriber = opts.follow.then(|| tree.watch());
        let total = tree.stats()?.items;
        Ok(Self {
            tree: tree.clone(),
            offset: opts.offset,
            filter: opts.filter,
            hooks: opts.hooks,
            hook_opts: opts.hook_opts,
            follow: opts.follow,
            raw: opts.raw,
            subscriber,
            shared: Arc::new(Shared::default()),
            total,
            scanned: 0,
            offset_seen: false,
            last_index: None,
            repr: HashMap::new(),
            done: false,
        })
    }

    pub fn handle(&self) -> ReaderHandle {
        ReaderHandle(self.shared.clone())
    }

    /// The filter matching ancestors standing in for `version` in the
    /// projection.
    fn representatives(&mut self, version: &Version) -> Result<Vec<Version>> {
        if let Some(reps) = self.repr.get(version) {
            return Ok(reps.clone());
        }
        // walk back along the branch to the nearest filter matching
        // ancestors; memoized for later arrivals
        let item = match self.tree.get_by_version(version)? {
            Some(item) => item,
            None => return Ok(Vec::new()),
        };
        let reps = if self.matches(&item) {
            vec![version.clone()]
        } else {
            self.parent_representatives(&item)?
        };
        self.repr.insert(version.clone(), reps.clone());
        Ok(reps)
    }

    fn parent_representatives(&mut self, item: &Item) -> Result<Vec<Version>> {
        let mut reps = Vec::new();
        for parent in item.header.parents.clone() {
            for rep in self.representatives(&parent)? {
                if !reps.contains(&rep) {
                    reps.push(rep);
                }
            }
        }
        Ok(reps)
    }

    fn matches(&self, item: &Item) -> bool {
        match &self.filter {
            None => true,
            Some(filter) => filter.iter().all(|(k, want)| {
                item.body
                    .get(k)
                    .map_or(false, |have| crate::item::canonical_eq(have, want))
            }),
        }
    }

    /// Processes one arrived item; `None` when it is suppressed.
    fn process(&mut self, item: Item) -> Result<Option<Emitted>> {
        self.scanned += 1;
        let version = item.version()?.clone();
        if !self.offset_seen {
            match &self.offset {
                None => self.offset_seen = true,
                Some(offset) if offset == &version => self.offset_seen = true,
                Some(_) => return Ok(None),
            }
        }

        let parents = self.parent_representatives(&item)?;
        let transformed = if self.matches(&item) {
            let mut current = Some(item);
            for hook in &mut self.hooks {
                current = match current {
                    Some(item) => hook(item, &self.hook_opts)?,
                    None => break,
                };
            }
            current
        } else {
            None
        };
        let out = match transformed {
            Some(out) => out,
            None => {
                // suppressed: future children refer to these ancestors
                self.repr.insert(version, parents);
                return Ok(None);
            }
        };
        self.repr.insert(version.clone(), vec![version]);
        let doc = out.to_projected_doc(&parents);
        Ok(Some(if self.raw {
            let mut bytes = Vec::new();
            doc.to_writer(&mut bytes)?;
            Emitted::Raw(bytes)
        } else {
            Emitted::Parsed(doc)
        }))
    }
}

impl Stream for Reader {
    type Item = Result<Emitted>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done || this.shared.closed.load(Ordering::SeqCst) {
                this.done = true;
                return Poll::Ready(None);
            }
            match this.tree.first_after(this.last_index) {
                Err(err) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Ok(Some(item)) => {
                    this.last_index = item.header.index;
                    match this.process(item) {
                        Ok(Some(out)) => return Poll::Ready(Some(Ok(out))),
                        Ok(None) => continue,
                        Err(err) => {
                            this.done = true;
                            return Poll::Ready(Some(Err(err)));
                        }
                    }
                }
                Ok(None) => {
                    if !this.offset_seen && this.offset.is_some() && this.scanned >= this.total {
                        this.done = true;
                        let offset = this.offset.clone().expect("checked");
                        return Poll::Ready(Some(Err(Error::OffsetNotFound(
                            offset.to_string(),
                        )
                        .into())));
                    }
                    if !this.follow {
                        return Poll::Ready(None);
                    }
                    let subscriber = this.subscriber.as_mut().expect("follow mode subscribes");
                    *this.shared.waker.lock().expect("waker lock") = Some(cx.waker().clone());
                    match Pin::new(subscriber).poll(cx) {
                        Poll::Ready(Some(_event)) => continue,
                        Poll::Ready(None) => {
                            this.done = true;
                            return Poll::Ready(None);
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::*;
    use crate::tree::TreeOptions;
    use bson::doc;
    use futures::StreamExt;

    fn tree() -> Tree {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Tree::open(db.open_tree("store").unwrap(), "_local", &TreeOptions::default()).unwrap()
    }

    /// A{}, B{A}, C{B}, D{C}, E{B}, F{E,C}, G{F}; bodies carry the markers
    /// the filter scenarios match on.
    fn fork_merge_tree() -> Tree {
        let t = tree();
        for it in [
            item("x", b"A00000", &[], doc! { "baz": "qux" }),
            item("x", b"B00000", &[b"A00000"], doc! { "baz": "zab" }),
            item("x", b"C00000", &[b"B00000"], doc! { "baz": "mux" }),
            item("x", b"D00000", &[b"C00000"], doc! { "baz": "qux" }),
            item("x", b"E00000", &[b"B00000"], doc! { "baz": "zab" }),
            item("x", b"F00000", &[b"E00000", b"C00000"], doc! { "baz": "zab" }),
            item("x", b"G00000", &[b"F00000"], doc! { "baz": "qux" }),
        ] {
            t.write(&it).unwrap();
        }
        t
    }

    fn versions_and_parents(emitted: &[Emitted]) -> Vec<(String, Vec<String>)> {
        emitted
            .iter()
            .map(|e| {
                let h = e.as_doc().unwrap().get_document("h").unwrap();
                let v = h.get_str("v").unwrap().to_string();
                let pa = h
                    .get_array("pa")
                    .unwrap()
                    .iter()
                    .map(|p| p.as_str().unwrap().to_string())
                    .collect();
                (v, pa)
            })
            .collect()
    }

    fn drain(reader: Reader) -> Vec<Emitted> {
        async_std::task::block_on(async {
            reader.map(|r| r.unwrap()).collect::<Vec<_>>().await
        })
    }

    #[test]
    fn emits_whole_dag_in_insertion_order() {
        let t = fork_merge_tree();
        let reader = Reader::new(
            &t,
            ReaderOptions {
                offset: Some(version(b"A00000")),
                ..ReaderOptions::default()
            },
        )
        .unwrap();
        let out = versions_and_parents(&drain(reader));
        let expect = [
            ("A00000", vec![]),
            ("B00000", vec!["A00000"]),
            ("C00000", vec!["B00000"]),
            ("D00000", vec!["C00000"]),
            ("E00000", vec!["B00000"]),
            ("F00000", vec!["E00000", "C00000"]),
            ("G00000", vec!["F00000"]),
        ];
        assert_eq!(out.len(), expect.len());
        for ((v, pa), (ev, epa)) in out.iter().zip(expect.iter()) {
            assert_eq!(v, &version(ev.as_bytes()).to_string());
            let epa = epa.iter().map(|p| version(p.as_bytes()).to_string()).collect::<Vec<_>>();
            assert_eq!(pa, &epa);
        }
    }

    #[test]
    fn filter_projects_a_connected_subgraph() {
        let t = fork_merge_tree();
        let reader = Reader::new(
            &t,
            ReaderOptions {
                filter: Some(doc! { "baz": "qux" }),
                ..ReaderOptions::default()
            },
        )
        .unwrap();
        let out = versions_and_parents(&drain(reader));
        let a = version(b"A00000").to_string();
        assert_eq!(
            out,
            vec![
                (a.clone(), vec![]),
                (version(b"D00000").to_string(), vec![a.clone()]),
                (version(b"G00000").to_string(), vec![a]),
            ]
        );
    }

    #[test]
    fn filter_can_replant_a_root() {
        let t = fork_merge_tree();
        let reader = Reader::new(
            &t,
            ReaderOptions {
                filter: Some(doc! { "baz": "mux" }),
                ..ReaderOptions::default()
            },
        )
        .unwrap();
        let out = versions_and_parents(&drain(reader));
        assert_eq!(out, vec![(version(b"C00000").to_string(), vec![])]);
    }

    #[test]
    fn hook_drop_rewires_parents_to_filter_matching_ancestors() {
        let t = fork_merge_tree();
        let f = version(b"F00000");
        let hook: Hook = Box::new(move |item: Item, _opts: &Document| {
            if item.header.version.as_ref() == Some(&f) {
                Ok(None)
            } else {
                Ok(Some(item))
            }
        });
        let reader = Reader::new(
            &t,
            ReaderOptions {
                offset: Some(version(b"E00000")),
                hooks: vec![hook],
                ..ReaderOptions::default()
            },
        )
        .unwrap();
        let out = versions_and_parents(&drain(reader));
        assert_eq!(
            out,
            vec![
                (version(b"E00000").to_string(), vec![version(b"B00000").to_string()]),
                (
                    version(b"G00000").to_string(),
                    vec![version(b"E00000").to_string(), version(b"C00000").to_string()]
                ),
            ]
        );
    }

    #[test]
    fn hooks_transform_the_body() {
        let t = fork_merge_tree();
        let hook: Hook = Box::new(|mut item: Item, opts: &Document| {
            item.body.insert("seen", opts.get_str("tag").unwrap_or("?"));
            Ok(Some(item))
        });
        let reader = Reader::new(
            &t,
            ReaderOptions {
                hooks: vec![hook],
                hook_opts: doc! { "tag": "hooked" },
                ..ReaderOptions::default()
            },
        )
        .unwrap();
        let out = drain(reader);
        assert_eq!(out.len(), 7);
        for e in &out {
            assert_eq!(e.as_doc().unwrap().get_document("b").unwrap().get_str("seen").unwrap(), "hooked");
        }
    }

    #[test]
    fn unknown_offset_fails() {
        let t = fork_merge_tree();
        let mut reader = Reader::new(
            &t,
            ReaderOptions {
                offset: Some(version(b"zzzzzz")),
                ..ReaderOptions::default()
            },
        )
        .unwrap();
        let err = async_std::task::block_on(reader.next()).unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::OffsetNotFound(_))
        ));
        assert!(async_std::task::block_on(reader.next()).is_none());
    }

    #[test]
    fn raw_mode_emits_encoded_documents() {
        let t = fork_merge_tree();
        let reader = Reader::new(
            &t,
            ReaderOptions {
                raw: true,
                ..ReaderOptions::default()
            },
        )
        .unwrap();
        let out = drain(reader);
        let first = match &out[0] {
            Emitted::Raw(bytes) => Document::from_reader(&bytes[..]).unwrap(),
            other => panic!("expected raw emission, got {:?}", other),
        };
        let h = first.get_document("h").unwrap();
        assert_eq!(h.get_str("v").unwrap(), version(b"A00000").to_string());
        assert!(h.get("pe").is_none());
        assert!(first.get("m").is_none());
    }

    #[test]
    fn emitted_items_are_stripped() {
        let t = fork_merge_tree();
        let reader = Reader::new(&t, ReaderOptions::default()).unwrap();
        let out = drain(reader);
        for e in &out {
            let doc = e.as_doc().unwrap();
            let h = doc.get_document("h").unwrap();
            assert!(h.get("pe").is_none());
            assert!(h.get("i").is_none());
            assert!(doc.get("m").is_none());
        }
    }

    #[async_std::test]
    async fn follow_tails_new_writes_and_close_ends_the_stream() {
        let t = fork_merge_tree();
        let reader = Reader::new(
            &t,
            ReaderOptions {
                follow: true,
                ..ReaderOptions::default()
            },
        )
        .unwrap();
        let handle = reader.handle();
        let mut reader = reader;
        for _ in 0..7 {
            reader.next().await.unwrap().unwrap();
        }
        t.write(&item("x", b"H00000", &[b"G00000"], doc! { "baz": "new" })).unwrap();
        let h = reader.next().await.unwrap().unwrap();
        let doc = h.as_doc().unwrap().get_document("h").unwrap();
        assert_eq!(doc.get_str("v").unwrap(), version(b"H00000").to_string());
        handle.close();
        handle.close();
        assert!(reader.next().await.is_none());
    }
}
