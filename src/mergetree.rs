//! The merge tree: one local tree, one stage tree and one tree per declared
//! remote perspective over a single keyspace.
//!
//! Foreign items enter through [`MergeTree::write_remote`] (or the bounded
//! [`RemoteSink`]); the writer pipeline mirrors them into the local
//! perspective. With a merge handler configured, new local items are staged
//! and only promoted to the local tree once the application confirms the
//! generated merge through the local write stream; without one, merges
//! auto confirm. The winning local version of every document is synced to
//! the companion plain store.

use crate::error::Error;
use crate::item::{Header, Id, Item, Meta, Perspective, Version, DEFAULT_LOCAL, DEFAULT_STAGE};
use crate::oplog::{apply_modifiers, OplogEntry, OplogOp};
use crate::reader::{Reader, ReaderOptions};
use crate::tree::{Tree, TreeOptions, TreeStats};
use crate::writer::{ingest_local, ingest_remote, PlainStore, WriterCtx};
use anyhow::Result;
use bson::Document;
use futures::channel::mpsc;
use futures::prelude::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Sink for merges the engine generated: `(merged, previous local head)`.
/// The merge is staged until a local write confirms its version.
pub type MergeHandler = Box<dyn FnMut(&Item, Option<&Item>) -> Result<()> + Send>;

/// Per item transform applied to foreign items before staging.
pub type Transform = Box<dyn FnMut(Item) -> Result<Item> + Send>;

pub struct MergeTreeOptions {
    /// Name of the local tree.
    pub local: String,
    /// Name of the stage tree.
    pub stage: String,
    /// Declared remote perspectives.
    pub perspectives: Vec<String>,
    /// Version byte width, 1..=6.
    pub v_size: usize,
    /// Insertion index byte width, 1..=6.
    pub i_size: usize,
    pub transform: Option<Transform>,
    pub merge_handler: Option<MergeHandler>,
    /// Companion unversioned store the winning version is synced to.
    pub plain_store: Option<Box<dyn PlainStore + Send>>,
    /// Ingress buffer capacity.
    pub queue_limit: usize,
    /// Backoff used by blocking senders on a full queue.
    pub queue_limit_retry_timeout: Duration,
    /// Drain the ingress queues at least this often while polled.
    pub auto_process_interval: Option<Duration>,
    /// Log and skip failing ids instead of aborting the batch.
    pub proceed_on_error: bool,
}

impl Default for MergeTreeOptions {
    fn default() -> Self {
        Self {
            local: DEFAULT_LOCAL.to_string(),
            stage: DEFAULT_STAGE.to_string(),
            perspectives: Vec::new(),
            v_size: crate::item::DEFAULT_VSIZE,
            i_size: crate::item::DEFAULT_ISIZE,
            transform: None,
            merge_handler: None,
            plain_store: None,
            queue_limit: 5000,
            queue_limit_retry_timeout: Duration::from_millis(4000),
            auto_process_interval: None,
            proceed_on_error: false,
        }
    }
}

enum Ingress {
    Remote(Vec<Item>),
    Local(Vec<Item>),
    Oplog(OplogEntry),
}

struct Expected {
    version: Version,
    /// `None` marks a deletion.
    body: Option<Document>,
}

/// Master-master replication engine over one ordered keyspace.
pub struct MergeTree {
    local: Tree,
    stage: Tree,
    perspectives: BTreeMap<String, Tree>,
    local_perspective: Perspective,
    v_size: usize,
    transform: Option<Transform>,
    merge_handler: Option<MergeHandler>,
    plain: Option<Box<dyn PlainStore + Send>>,
    proceed_on_error: bool,
    /// plain store writes awaiting their change log echo, per id
    expected: HashMap<Vec<u8>, VecDeque<Expected>>,
    queue_limit: usize,
    queue_limit_retry_timeout: Duration,
    auto_process_interval: Option<Duration>,
    tx: mpsc::Sender<Ingress>,
    rx: mpsc::Receiver<Ingress>,
}

impl MergeTree {
    pub fn new(db: &sled::Db, opts: MergeTreeOptions) -> Result<Self> {
        let tree_opts = TreeOptions {
            v_size: opts.v_size,
            i_size: opts.i_size,
        };
        let store = db.open_tree("store").map_err(Error::from)?;
        let mut names = vec![opts.local.clone(), opts.stage.clone()];
        for pe in &opts.perspectives {
            names.push(pe.clone());
        }
        for (n, name) in names.iter().enumerate() {
            if names[..n].contains(name) {
                return Err(Error::PerspectiveMismatch {
                    expected: "pairwise distinct names".to_string(),
                    actual: name.clone(),
                }
                .into());
            }
        }
        let local = Tree::open(store.clone(), &opts.local, &tree_opts)?;
        let stage = Tree::open_partial(store.clone(), &opts.stage, &tree_opts)?;
        let mut perspectives = BTreeMap::new();
        for pe in &opts.perspectives {
            perspectives.insert(pe.clone(), Tree::open(store.clone(), pe, &tree_opts)?);
        }
        let (tx, rx) = mpsc::channel(opts.queue_limit);
        Ok(Self {
            local,
            stage,
            perspectives,
            local_perspective: Perspective::new(opts.local.clone())?,
            v_size: opts.v_size,
            transform: opts.transform,
            merge_handler: opts.merge_handler,
            plain: opts.plain_store,
            proceed_on_error: opts.proceed_on_error,
            expected: HashMap::new(),
            queue_limit: opts.queue_limit,
            queue_limit_retry_timeout: opts.queue_limit_retry_timeout,
            auto_process_interval: opts.auto_process_interval,
            tx,
            rx,
        })
    }

    /// In-memory engine for tests.
    #[cfg(test)]
    pub fn memory(opts: MergeTreeOptions) -> Result<Self> {
        use tracing_subscriber::EnvFilter;
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();
        let db = sled::Config::new().temporary(true).open()?;
        Self::new(&db, opts)
    }

    pub fn local_tree(&self) -> &Tree {
        &self.local
    }

    pub fn stage_tree(&self) -> &Tree {
        &self.stage
    }

    pub fn perspective_tree(&self, name: &str) -> Option<&Tree> {
        self.perspectives.get(name)
    }

    /// True if new local items await confirmation in the stage.
    fn staging(&self) -> bool {
        self.merge_handler.is_some()
    }

    /// Ingests one batch of items of one declared remote perspective.
    pub fn write_remote(&mut self, items: Vec<Item>) -> Result<()> {
        let pe = match items.first() {
            Some(item) => item.header.perspective.clone(),
            None => return Ok(()),
        };
        if pe.as_str() == self.local.name() || pe.as_str() == self.stage.name() {
            return Err(Error::PerspectiveMismatch {
                expected: "a declared remote perspective".to_string(),
                actual: pe.to_string(),
            }
            .into());
        }
        let remote = match self.perspectives.get(pe.as_str()) {
            Some(tree) => tree.clone(),
            None => {
                return Err(Error::PerspectiveMismatch {
                    expected: "a declared remote perspective".to_string(),
                    actual: pe.to_string(),
                }
                .into())
            }
        };
        let items = match &mut self.transform {
            Some(transform) => items
                .into_iter()
                .map(|item| transform(item))
                .collect::<Result<Vec<_>>>()?,
            None => items,
        };

        let stage = self.staging().then(|| self.stage.clone());
        let local = self.local.clone();
        let outcome = {
            let ctx = WriterCtx {
                local: &local,
                stage: stage.as_ref(),
                local_perspective: self.local_perspective.clone(),
                v_size: self.v_size,
                proceed_on_error: self.proceed_on_error,
            };
            ingest_remote(&ctx, &remote, items)?
        };

        if self.staging() {
            let handler = self.merge_handler.as_mut().expect("staging implies handler");
            for (merged, previous) in &outcome.merges {
                handler(merged, previous.as_ref())?;
            }
        } else {
            let heads = outcome.heads.clone();
            self.sync_heads(&heads)?;
        }
        Ok(())
    }

    /// Ingests items from the owning application. An item whose version
    /// matches a staged item confirms the stage up to and including that
    /// version; anything else is a fresh write and must not carry parents.
    pub fn write_local(&mut self, items: Vec<Item>) -> Result<()> {
        for item in items {
            if !item.header.parents.is_empty() {
                return Err(Error::InvalidItem(format!(
                    "local write for {} must not carry parents",
                    item.header.id
                ))
                .into());
            }
            if let Some(version) = item.header.version.clone() {
                if self
                    .stage
                    .get_by_version(&version)?
                    .map_or(false, |staged| staged.header.id == item.header.id)
                {
                    self.confirm(&item.header.id, &version)?;
                    continue;
                }
                if self.local.contains_version(&version)? {
                    return Err(Error::OutOfOrderConfirmation(version.to_string()).into());
                }
            }
            let local = self.local.clone();
            let ctx = WriterCtx {
                local: &local,
                stage: None,
                local_perspective: self.local_perspective.clone(),
                v_size: self.v_size,
                proceed_on_error: self.proceed_on_error,
            };
            let stored = ingest_local(&ctx, item)?;
            self.sync_heads(&[stored])?;
        }
        Ok(())
    }

    /// Promotes the staged items of `id` up to and including `version` to
    /// the local tree and drops them from the stage.
    fn confirm(&mut self, id: &Id, version: &Version) -> Result<()> {
        let staged = self.stage.iter_id(id, false).collect::<Result<Vec<_>>>()?;
        let upto = staged
            .iter()
            .position(|item| item.header.version.as_ref() == Some(version))
            .ok_or_else(|| Error::OutOfOrderConfirmation(version.to_string()))?;
        let mut head = None;
        for item in &staged[..=upto] {
            let stored = self.local.write(item)?;
            tracing::debug!("promoted {} for {}", version, id);
            if !stored.header.conflict {
                head = Some(stored);
            }
            self.stage.remove(item)?;
        }
        if let Some(head) = head {
            self.sync_heads(&[head])?;
        }
        Ok(())
    }

    /// Drains new items from a source tree through the writer pipeline,
    /// generating merges against the current local head. Returns the number
    /// of drained items.
    pub fn merge_with_local(&mut self, source: &Tree) -> Result<usize> {
        if !self.perspectives.contains_key(source.name()) {
            return Err(Error::PerspectiveMismatch {
                expected: "a declared remote perspective".to_string(),
                actual: source.name().to_string(),
            }
            .into());
        }
        let watermark_key = b"merged-upto";
        let target = self.perspectives.get(source.name()).expect("checked").clone();
        let watermark = match target.get_user(watermark_key)? {
            Some(bytes) => Some(u64::from_be_bytes(bytes.try_into().map_err(|_| {
                Error::InvalidItem("malformed merge watermark".into())
            })?)),
            None => None,
        };
        let mut items = Vec::new();
        let mut last = watermark;
        for res in source.iter_all(false) {
            let item = res?;
            let index = item.header.index;
            if let (Some(seen), Some(i)) = (watermark, index) {
                if i <= seen {
                    continue;
                }
            }
            if let Some(i) = index {
                last = Some(i);
            }
            items.push(item);
        }
        let drained = items.len();
        if drained > 0 {
            self.write_remote(items)?;
            if let Some(last) = last {
                target.put_user(watermark_key, &last.to_be_bytes())?;
            }
        }
        Ok(drained)
    }

    /// Applies one change log entry of the companion plain store. Entries
    /// that echo the engine's own plain store writes acknowledge the
    /// originating item instead of creating a new one.
    pub fn apply_oplog(&mut self, entry: OplogEntry) -> Result<()> {
        let id = entry.id()?;
        if let Some(queue) = self.expected.get_mut(id.as_bytes()) {
            let echo = queue.front().map_or(false, |e| match (&e.body, entry.op) {
                (None, OplogOp::Delete) => true,
                (Some(body), OplogOp::Insert | OplogOp::Update) => {
                    !entry.is_modifier() && bodies_match(body, &entry.o)
                }
                _ => false,
            });
            if echo {
                let expected = queue.pop_front().expect("checked front");
                if queue.is_empty() {
                    self.expected.remove(id.as_bytes());
                }
                self.local.ack(&expected.version)?;
                tracing::debug!("acknowledged {} for {}", expected.version, id);
                return Ok(());
            }
        }

        let mut item = match entry.op {
            OplogOp::Insert => Item::new(
                Header::new(id, self.local_perspective.clone()),
                entry.o.clone(),
            ),
            OplogOp::Update if entry.is_modifier() => {
                let base = self
                    .last_acked(&id)?
                    .ok_or_else(|| Error::InvalidItem(format!("no acked item for {}", id)))?;
                let body = apply_modifiers(&base.body, &entry.o)?;
                Item::new(Header::new(id, self.local_perspective.clone()), body)
            }
            OplogOp::Update => Item::new(
                Header::new(id, self.local_perspective.clone()),
                entry.o.clone(),
            ),
            OplogOp::Delete => {
                let mut header = Header::new(id, self.local_perspective.clone());
                header.deleted = true;
                Item::new(header, Document::new())
            }
        };
        item.meta = Meta {
            ack: true,
            op: entry.ts,
        };
        let local = self.local.clone();
        let ctx = WriterCtx {
            local: &local,
            stage: None,
            local_perspective: self.local_perspective.clone(),
            v_size: self.v_size,
            proceed_on_error: self.proceed_on_error,
        };
        // no plain store sync: the entry came from the plain store
        ingest_local(&ctx, item)?;
        Ok(())
    }

    fn last_acked(&self, id: &Id) -> Result<Option<Item>> {
        for res in self.local.iter_id(id, true) {
            let item = res?;
            if item.meta.ack {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn sync_heads(&mut self, heads: &[Item]) -> Result<()> {
        for head in heads {
            if head.header.conflict {
                continue;
            }
            let id = &head.header.id;
            let version = head.version()?.clone();
            if let Some(plain) = &mut self.plain {
                if head.header.deleted {
                    plain.remove(id)?;
                } else {
                    plain.upsert(id, &head.body)?;
                }
            }
            self.expected
                .entry(id.as_bytes().to_vec())
                .or_default()
                .push_back(Expected {
                    version,
                    body: (!head.header.deleted).then(|| head.body.clone()),
                });
        }
        Ok(())
    }

    /// Stream over the local tree.
    pub fn reader(&self, opts: ReaderOptions) -> Result<Reader> {
        Reader::new(&self.local, opts)
    }

    /// Export is the reader; foreign peers replay it into
    /// [`MergeTree::import`].
    pub fn export(&self, opts: ReaderOptions) -> Result<Reader> {
        self.reader(opts)
    }

    /// Imports documents a foreign peer exported, as perspective `name`.
    pub fn import(&mut self, name: &str, docs: Vec<Document>) -> Result<usize> {
        let perspective = Perspective::new(name)?;
        let mut items = Vec::with_capacity(docs.len());
        for doc in &docs {
            let mut item = Item::from_wire(doc, &perspective)?;
            item.meta = Meta::default();
            items.push(item);
        }
        let count = items.len();
        let last = items.last().and_then(|item| item.header.version.clone());
        self.write_remote(items)?;
        if let (Some(tree), Some(version)) = (self.perspectives.get(name), last) {
            tree.put_user(b"last-offset", version.as_bytes())?;
        }
        Ok(count)
    }

    /// The replication watermark for a perspective: the version to resume
    /// exporting from.
    pub fn last_offset(&self, name: &str) -> Result<Option<Version>> {
        match self.perspectives.get(name) {
            Some(tree) => match tree.get_user(b"last-offset")? {
                Some(bytes) => Ok(Some(Version::new(&bytes)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> Result<BTreeMap<String, TreeStats>> {
        let mut stats = BTreeMap::new();
        stats.insert(self.local.name().to_string(), self.local.stats()?);
        stats.insert(self.stage.name().to_string(), self.stage.stats()?);
        for (name, tree) in &self.perspectives {
            stats.insert(name.clone(), tree.stats()?);
        }
        Ok(stats)
    }

    /// Bounded sink feeding [`MergeTree::write_remote`] while the engine is
    /// polled.
    pub fn remote_sink(&self) -> RemoteSink {
        RemoteSink {
            tx: self.tx.clone(),
            retry: self.queue_limit_retry_timeout,
        }
    }

    /// Bounded sink feeding [`MergeTree::write_local`] and
    /// [`MergeTree::apply_oplog`] while the engine is polled.
    pub fn local_sink(&self) -> LocalSink {
        LocalSink {
            tx: self.tx.clone(),
            retry: self.queue_limit_retry_timeout,
        }
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    fn dispatch(&mut self, ingress: Ingress) -> Result<()> {
        match ingress {
            Ingress::Remote(items) => self.write_remote(items),
            Ingress::Local(items) => self.write_local(items),
            Ingress::Oplog(entry) => self.apply_oplog(entry),
        }
    }

    /// Drains whatever is queued right now without waiting. Callers that do
    /// not poll the engine as a future drive this on their own schedule;
    /// [`MergeTreeOptions::auto_process_interval`] is the cadence they are
    /// expected to use.
    pub fn process_pending(&mut self) -> Result<usize> {
        let mut drained = 0;
        while let Ok(Some(ingress)) = self.rx.try_next() {
            self.dispatch(ingress)?;
            drained += 1;
        }
        Ok(drained)
    }

    pub fn auto_process_interval(&self) -> Option<Duration> {
        self.auto_process_interval
    }
}

fn bodies_match(expected: &Document, observed: &Document) -> bool {
    let strip = |doc: &Document| {
        let mut doc = doc.clone();
        doc.remove("_id");
        doc
    };
    crate::item::canonical_eq(
        &bson::Bson::Document(strip(expected)),
        &bson::Bson::Document(strip(observed)),
    )
}

/// Drains ingress batches FIFO until all sinks are dropped.
impl Future for MergeTree {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        loop {
            match Pin::new(&mut self.rx).poll_next(cx) {
                Poll::Ready(Some(ingress)) => {
                    if let Err(err) = self.dispatch(ingress) {
                        if self.proceed_on_error {
                            tracing::warn!("dropping failed batch: {}", err);
                        } else {
                            return Poll::Ready(Err(err));
                        }
                    }
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Clonable bounded sender of foreign perspective batches.
#[derive(Clone)]
pub struct RemoteSink {
    tx: mpsc::Sender<Ingress>,
    retry: Duration,
}

impl RemoteSink {
    pub async fn send(&mut self, items: Vec<Item>) -> Result<()> {
        self.tx
            .send(Ingress::Remote(items))
            .await
            .map_err(|err| Error::InvalidItem(format!("engine gone: {}", err)).into())
    }

    /// Blocking send that retries with backoff while the queue is full.
    pub fn send_blocking(&mut self, items: Vec<Item>) -> Result<()> {
        let mut items = items;
        loop {
            match self.tx.try_send(Ingress::Remote(items)) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_full() => {
                    match err.into_inner() {
                        Ingress::Remote(back) => items = back,
                        _ => unreachable!("remote sink only sends remote batches"),
                    }
                    tracing::debug!("ingress queue full, retrying");
                    std::thread::sleep(self.retry);
                }
                Err(err) => {
                    return Err(Error::InvalidItem(format!("engine gone: {}", err)).into())
                }
            }
        }
    }
}

/// Clonable bounded sender of application writes and change log entries.
#[derive(Clone)]
pub struct LocalSink {
    tx: mpsc::Sender<Ingress>,
    retry: Duration,
}

impl LocalSink {
    pub async fn send(&mut self, items: Vec<Item>) -> Result<()> {
        self.tx
            .send(Ingress::Local(items))
            .await
            .map_err(|err| Error::InvalidItem(format!("engine gone: {}", err)).into())
    }

    pub async fn send_oplog(&mut self, entry: OplogEntry) -> Result<()> {
        self.tx
            .send(Ingress::Oplog(entry))
            .await
            .map_err(|err| Error::InvalidItem(format!("engine gone: {}", err)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::*;
    use crate::writer::MemoryPlainStore;
    use bson::{doc, Bson, Timestamp};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedPlain(Arc<Mutex<MemoryPlainStore>>);

    impl SharedPlain {
        fn get(&self, id: &Id) -> Option<Document> {
            self.0.lock().unwrap().get(id).cloned()
        }

        fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    impl PlainStore for SharedPlain {
        fn upsert(&mut self, id: &Id, body: &Document) -> Result<()> {
            self.0.lock().unwrap().upsert(id, body)
        }

        fn remove(&mut self, id: &Id) -> Result<()> {
            self.0.lock().unwrap().remove(id)
        }
    }

    fn engine(perspectives: &[&str]) -> (MergeTree, SharedPlain) {
        let plain = SharedPlain::default();
        let tree = MergeTree::memory(MergeTreeOptions {
            perspectives: perspectives.iter().map(|s| s.to_string()).collect(),
            plain_store: Some(Box::new(plain.clone())),
            ..MergeTreeOptions::default()
        })
        .unwrap();
        (tree, plain)
    }

    fn remote_item(pe: &str, id_: &str, v: &[u8], parents: &[&[u8]], body: Document) -> Item {
        let mut it = item(id_, v, parents, body);
        it.header.perspective = perspective(pe);
        it
    }

    fn local_write(id_: &str, body: Document) -> Item {
        Item::new(Header::new(id(id_), perspective("_local")), body)
    }

    fn versions(tree: &Tree) -> Vec<Version> {
        tree.iter_all(false)
            .map(|r| r.unwrap().version().unwrap().clone())
            .collect()
    }

    #[test]
    fn remote_batch_is_mirrored_into_local() {
        let (mut engine, plain) = engine(&["peerA"]);
        engine
            .write_remote(vec![
                remote_item("peerA", "x", b"X00000", &[], doc! { "foo": "bar" }),
                remote_item("peerA", "x", b"Y00000", &[b"X00000"], doc! { "foo": "baz" }),
            ])
            .unwrap();
        let remote = engine.perspective_tree("peerA").unwrap();
        assert_eq!(versions(remote), vec![version(b"X00000"), version(b"Y00000")]);
        // every remote version has a local sibling
        assert_eq!(
            versions(engine.local_tree()),
            vec![version(b"X00000"), version(b"Y00000")]
        );
        let head = engine.local_tree().head(&id("x")).unwrap().unwrap();
        assert_eq!(head.header.version, Some(version(b"Y00000")));
        assert_eq!(plain.get(&id("x")).unwrap(), doc! { "foo": "baz" });
    }

    #[test]
    fn reserved_or_undeclared_perspectives_are_rejected() {
        let (mut engine, _) = engine(&["peerA"]);
        for pe in ["_local", "_stage", "peerB"] {
            let err = engine
                .write_remote(vec![remote_item(pe, "x", b"X00000", &[], doc! {})])
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::PerspectiveMismatch { .. })
            ));
        }
    }

    #[test]
    fn local_writes_get_parents_and_versions_from_the_engine() {
        let (mut engine, plain) = engine(&[]);
        engine.write_local(vec![local_write("x", doc! { "n": 1 })]).unwrap();
        let first = engine.local_tree().head(&id("x")).unwrap().unwrap();
        assert!(first.header.version.is_some());
        assert!(first.header.parents.is_empty());
        engine.write_local(vec![local_write("x", doc! { "n": 2 })]).unwrap();
        let second = engine.local_tree().head(&id("x")).unwrap().unwrap();
        assert_eq!(second.header.parents, vec![first.version().unwrap().clone()]);
        assert_eq!(plain.get(&id("x")).unwrap(), doc! { "n": 2 });

        let mut with_parents = local_write("x", doc! {});
        with_parents.header.parents = vec![version(b"X00000")];
        let err = engine.write_local(vec![with_parents]).unwrap_err();
        assert!(err.to_string().contains("must not carry parents"));
    }

    #[test]
    fn divergence_produces_the_same_merge_on_every_peer() {
        let run = || {
            let (mut engine, plain) = engine(&["peerA"]);
            engine
                .write_remote(vec![remote_item("peerA", "x", b"X00000", &[], doc! { "n": 1 })])
                .unwrap();
            engine
                .write_local(vec![local_write("x", doc! { "n": 1, "loc": 1 })])
                .unwrap();
            engine
                .write_remote(vec![remote_item(
                    "peerA",
                    "x",
                    b"Y00000",
                    &[b"X00000"],
                    doc! { "n": 2 },
                )])
                .unwrap();
            let head = engine.local_tree().head(&id("x")).unwrap().unwrap();
            (head, plain.get(&id("x")).unwrap())
        };
        let (head1, plain1) = run();
        let (head2, _) = run();
        assert_eq!(head1.body, doc! { "loc": 1, "n": 2 });
        assert_eq!(plain1, head1.body);
        assert_eq!(head1.header.parents.len(), 2);
        // deterministic content version: both peers computed the same merge
        assert_eq!(head1.header.version, head2.header.version);
    }

    #[test]
    fn conflicting_remote_change_is_flagged_and_kept_aside() {
        let (mut engine, plain) = engine(&["peerA"]);
        engine
            .write_remote(vec![remote_item("peerA", "x", b"X00000", &[], doc! { "foo": 0 })])
            .unwrap();
        engine
            .write_local(vec![local_write("x", doc! { "foo": 1 })])
            .unwrap();
        let local_head = engine.local_tree().head(&id("x")).unwrap().unwrap();
        engine
            .write_remote(vec![remote_item(
                "peerA",
                "x",
                b"Y00000",
                &[b"X00000"],
                doc! { "foo": 2 },
            )])
            .unwrap();
        // the clean head is unchanged, the foreign branch is a flagged head
        let head = engine.local_tree().head(&id("x")).unwrap().unwrap();
        assert_eq!(head.header.version, local_head.header.version);
        let flagged = engine
            .local_tree()
            .get_by_version(&version(b"Y00000"))
            .unwrap()
            .unwrap();
        assert!(flagged.header.conflict);
        assert_eq!(plain.get(&id("x")).unwrap(), doc! { "foo": 1 });
    }

    #[test]
    fn root_preceded_by_a_live_item_is_rejected() {
        let (mut engine, _) = engine(&["peerA"]);
        engine
            .write_remote(vec![remote_item("peerA", "x", b"X00000", &[], doc! {})])
            .unwrap();
        let err = engine
            .write_remote(vec![remote_item("peerA", "x", b"Z00000", &[], doc! {})])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::RootPreceded(_))
        ));
    }

    #[test]
    fn proceed_on_error_skips_the_failing_id() {
        let plain = SharedPlain::default();
        let mut engine = MergeTree::memory(MergeTreeOptions {
            perspectives: vec!["peerA".to_string()],
            plain_store: Some(Box::new(plain.clone())),
            proceed_on_error: true,
            ..MergeTreeOptions::default()
        })
        .unwrap();
        engine
            .write_remote(vec![remote_item("peerA", "x", b"X00000", &[], doc! {})])
            .unwrap();
        engine
            .write_remote(vec![
                // new root for x while its tail is live: fails
                remote_item("peerA", "x", b"Z00000", &[], doc! {}),
                remote_item("peerA", "y", b"W00000", &[], doc! { "ok": true }),
            ])
            .unwrap();
        assert!(engine
            .perspective_tree("peerA")
            .unwrap()
            .get_by_version(&version(b"Z00000"))
            .unwrap()
            .is_none());
        assert_eq!(plain.get(&id("y")).unwrap(), doc! { "ok": true });
    }

    #[test]
    fn staged_confirmation_promotes_the_prefix() {
        let handled: Arc<Mutex<Vec<Version>>> = Arc::default();
        let record = handled.clone();
        let plain = SharedPlain::default();
        let mut engine = MergeTree::memory(MergeTreeOptions {
            perspectives: vec!["peerA".to_string()],
            plain_store: Some(Box::new(plain.clone())),
            merge_handler: Some(Box::new(move |merged: &Item, _prev: Option<&Item>| {
                record.lock().unwrap().push(merged.version()?.clone());
                Ok(())
            })),
            ..MergeTreeOptions::default()
        })
        .unwrap();

        // shared base, then the local side advances on its own
        engine.write_local(vec![local_write("x", doc! { "baz": 0 })]).unwrap();
        let w0 = engine.local_tree().head(&id("x")).unwrap().unwrap();
        let w0v = w0.version().unwrap().clone();
        engine
            .write_local(vec![local_write("x", doc! { "baz": 0, "loc": 1 })])
            .unwrap();

        // the remote peer knows the shared base and extends it three times
        let mut r0 = remote_item("peerA", "x", b"______", &[], doc! { "baz": 0 });
        r0.header.version = Some(w0v.clone());
        let mut x = remote_item("peerA", "x", b"X00000", &[], doc! { "baz": 0, "x": 1 });
        x.header.parents = vec![w0v.clone()];
        engine.write_remote(vec![r0, x]).unwrap();
        engine
            .write_remote(vec![remote_item(
                "peerA",
                "x",
                b"Y00000",
                &[b"X00000"],
                doc! { "baz": 0, "x": 1, "y": 1 },
            )])
            .unwrap();
        engine
            .write_remote(vec![remote_item(
                "peerA",
                "x",
                b"Z00000",
                &[b"Y00000"],
                doc! { "baz": 0, "x": 1, "y": 1, "z": 1 },
            )])
            .unwrap();

        let merges = handled.lock().unwrap().clone();
        assert_eq!(merges.len(), 3, "one merge per diverging remote head");
        // nothing is promoted yet
        assert_eq!(versions(engine.local_tree()).len(), 2);
        assert!(plain.get(&id("x")).unwrap().get("x").is_none());

        // confirming the second merge promotes X and Y, leaves Z staged
        let mut confirm = local_write("x", Document::new());
        confirm.header.version = Some(merges[1].clone());
        engine.write_local(vec![confirm]).unwrap();
        let local = versions(engine.local_tree());
        assert!(local.contains(&version(b"X00000")));
        assert!(local.contains(&version(b"Y00000")));
        assert!(local.contains(&merges[0]));
        assert!(local.contains(&merges[1]));
        assert!(!local.contains(&version(b"Z00000")));
        let staged = versions(engine.stage_tree());
        assert!(staged.contains(&version(b"Z00000")));
        assert!(staged.contains(&merges[2]));
        assert_eq!(
            plain.get(&id("x")).unwrap(),
            doc! { "baz": 0, "loc": 1, "x": 1, "y": 1 }
        );

        // confirming the first merge afterwards is out of order
        let mut stale = local_write("x", Document::new());
        stale.header.version = Some(merges[0].clone());
        let err = engine.write_local(vec![stale]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::OutOfOrderConfirmation(_))
        ));

        // confirming the last merge drains the stage
        let mut rest = local_write("x", Document::new());
        rest.header.version = Some(merges[2].clone());
        engine.write_local(vec![rest]).unwrap();
        assert!(versions(engine.stage_tree()).is_empty());
        assert!(versions(engine.local_tree()).contains(&version(b"Z00000")));
    }

    #[test]
    fn oplog_entries_become_local_writes_and_echoes_acknowledge() {
        let (mut engine, plain) = engine(&["peerA"]);
        let ts = |t| Bson::Timestamp(Timestamp { time: t, increment: 0 });
        let insert = OplogEntry::from_doc(&doc! {
            "op": "i", "ns": "db.things", "ts": ts(1),
            "o": { "_id": "x", "a": 1 },
        })
        .unwrap();
        engine.apply_oplog(insert).unwrap();
        let head = engine.local_tree().head(&id("x")).unwrap().unwrap();
        assert!(head.meta.ack);
        assert_eq!(head.meta.op.time, 1);
        assert_eq!(head.body.get_i32("a").unwrap(), 1);
        // the oplog reflects the plain store, nothing is written back
        assert_eq!(plain.len(), 0);

        let update = OplogEntry::from_doc(&doc! {
            "op": "u", "ns": "db.things", "ts": ts(2),
            "o": { "$inc": { "a": 1 } },
            "o2": { "_id": "x" },
        })
        .unwrap();
        engine.apply_oplog(update).unwrap();
        let head = engine.local_tree().head(&id("x")).unwrap().unwrap();
        assert_eq!(head.body.get_i64("a").unwrap(), 2);

        let delete = OplogEntry::from_doc(&doc! {
            "op": "d", "ns": "db.things", "ts": ts(3),
            "o": { "_id": "x" },
        })
        .unwrap();
        engine.apply_oplog(delete).unwrap();
        let tail = engine.local_tree().head(&id("x")).unwrap().unwrap();
        assert!(tail.header.deleted);

        // a foreign root reconnects the tombstone and syncs the plain store
        engine
            .write_remote(vec![remote_item("peerA", "x", b"R00000", &[], doc! { "a": 9 })])
            .unwrap();
        let reconnected = engine
            .local_tree()
            .get_by_version(&version(b"R00000"))
            .unwrap()
            .unwrap();
        assert_eq!(reconnected.header.parents, vec![tail.version().unwrap().clone()]);
        assert_eq!(plain.get(&id("x")).unwrap(), doc! { "a": 9 });
        assert!(!reconnected.meta.ack);

        // the plain store write comes back through the oplog: acknowledge,
        // do not create a new item
        let count = versions(engine.local_tree()).len();
        let echo = OplogEntry::from_doc(&doc! {
            "op": "i", "ns": "db.things", "ts": ts(4),
            "o": { "_id": "x", "a": 9 },
        })
        .unwrap();
        engine.apply_oplog(echo).unwrap();
        assert_eq!(versions(engine.local_tree()).len(), count);
        let acked = engine
            .local_tree()
            .get_by_version(&version(b"R00000"))
            .unwrap()
            .unwrap();
        assert!(acked.meta.ack);
    }

    #[test]
    fn export_then_import_restores_the_tree() {
        let (mut one, _) = engine(&[]);
        one.write_local(vec![local_write("x", doc! { "n": 1 })]).unwrap();
        one.write_local(vec![local_write("x", doc! { "n": 2 })]).unwrap();
        one.write_local(vec![local_write("y", doc! { "m": 1 })]).unwrap();

        let exported = {
            let reader = one.export(crate::reader::ReaderOptions::default()).unwrap();
            async_std::task::block_on(async {
                use futures::StreamExt;
                reader
                    .map(|r| r.unwrap().as_doc().unwrap().clone())
                    .collect::<Vec<_>>()
                    .await
            })
        };
        assert_eq!(exported.len(), 3);

        let (mut two, plain) = engine(&["peer1"]);
        two.import("peer1", exported).unwrap();
        let original = one
            .local_tree()
            .iter_all(false)
            .map(|r| {
                let it = r.unwrap();
                (it.version().unwrap().clone(), it.header.parents.clone(), it.body.clone())
            })
            .collect::<Vec<_>>();
        let mirrored = two
            .perspective_tree("peer1")
            .unwrap()
            .iter_all(false)
            .map(|r| {
                let it = r.unwrap();
                (it.version().unwrap().clone(), it.header.parents.clone(), it.body.clone())
            })
            .collect::<Vec<_>>();
        assert_eq!(original, mirrored);
        // and the local perspective mirrors it too
        assert_eq!(versions(two.local_tree()).len(), 3);
        assert_eq!(plain.get(&id("x")).unwrap(), doc! { "n": 2 });
        assert_eq!(
            two.last_offset("peer1").unwrap(),
            original.last().map(|(v, _, _)| v.clone())
        );
    }

    #[test]
    fn merge_with_local_drains_a_source_tree() {
        let (mut engine, plain) = engine(&["peerA"]);
        let db = sled::Config::new().temporary(true).open().unwrap();
        let source = Tree::open(
            db.open_tree("buffer").unwrap(),
            "peerA",
            &crate::tree::TreeOptions::default(),
        )
        .unwrap();
        source
            .write(&remote_item("peerA", "x", b"X00000", &[], doc! { "n": 1 }))
            .unwrap();
        source
            .write(&remote_item("peerA", "x", b"Y00000", &[b"X00000"], doc! { "n": 2 }))
            .unwrap();
        assert_eq!(engine.merge_with_local(&source).unwrap(), 2);
        assert_eq!(plain.get(&id("x")).unwrap(), doc! { "n": 2 });
        // watermark: a second pass drains nothing
        assert_eq!(engine.merge_with_local(&source).unwrap(), 0);
        source
            .write(&remote_item("peerA", "x", b"Z00000", &[b"Y00000"], doc! { "n": 3 }))
            .unwrap();
        assert_eq!(engine.merge_with_local(&source).unwrap(), 1);
        assert_eq!(plain.get(&id("x")).unwrap(), doc! { "n": 3 });
    }

    #[async_std::test]
    async fn sinks_feed_the_engine_while_it_is_polled() {
        let (engine, plain) = engine(&["peerA"]);
        let mut engine = engine;
        let mut remote = engine.remote_sink();
        let mut local = engine.local_sink();
        remote
            .send(vec![remote_item("peerA", "x", b"X00000", &[], doc! { "n": 1 })])
            .await
            .unwrap();
        local.send(vec![local_write("y", doc! { "m": 1 })]).await.unwrap();

        // the engine drains everything queued, then goes idle
        futures::future::poll_fn(|cx| match Pin::new(&mut engine).poll(cx) {
            Poll::Pending => Poll::Ready(Ok(())),
            Poll::Ready(res) => Poll::Ready(res),
        })
        .await
        .unwrap();

        assert_eq!(plain.len(), 2);
        assert_eq!(versions(engine.local_tree()).len(), 2);
    }

    #[test]
    fn process_pending_drains_without_polling() {
        let (mut engine, plain) = engine(&["peerA"]);
        let mut remote = engine.remote_sink();
        async_std::task::block_on(remote.send(vec![remote_item(
            "peerA",
            "x",
            b"X00000",
            &[],
            doc! { "n": 1 },
        )]))
        .unwrap();
        assert_eq!(engine.process_pending().unwrap(), 1);
        assert_eq!(engine.process_pending().unwrap(), 0);
        assert_eq!(plain.len(), 1);
    }
}
