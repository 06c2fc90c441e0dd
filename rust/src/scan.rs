//! The Scan Worker: a single-threaded cooperative loop that owns the
//! dedup tables and recursively classifies metadata objects.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::digest::{validate_name, Checksum, ObjectKind, ObjectName};
use crate::error::{PullError, PullResult};
use crate::limits::MAX_RECURSION;
use crate::queue::{ErrorSender, FetchSender, ScanReceiver, ToFetch, ToScan};
use crate::records::{parse_commit, parse_dir_tree};
use crate::store::Store;

/// Options that change which edges `Classify` walks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Walk a commit's `related` field too (the `--related` CLI flag).
    pub related: bool,
}

/// The three dedup tables the Scan Worker owns exclusively. Never shared
/// outside this struct; the worker lives on its own OS thread.
struct DedupTables {
    scanned_metadata: HashSet<ObjectName>,
    requested_metadata: HashSet<Checksum>,
    requested_content: HashSet<Checksum>,
}

impl DedupTables {
    fn new() -> Self {
        Self {
            scanned_metadata: HashSet::new(),
            requested_metadata: HashSet::new(),
            requested_content: HashSet::new(),
        }
    }
}

pub struct ScanWorker<S: Store> {
    store: Arc<S>,
    to_fetch: FetchSender,
    errors: ErrorSender,
    options: ScanOptions,
    tables: DedupTables,
    n_scanned_metadata: Arc<AtomicU64>,
}

impl<S: Store> ScanWorker<S> {
    pub fn new(
        store: Arc<S>,
        to_fetch: FetchSender,
        errors: ErrorSender,
        options: ScanOptions,
        n_scanned_metadata: Arc<AtomicU64>,
    ) -> Self {
        Self {
            store,
            to_fetch,
            errors,
            options,
            tables: DedupTables::new(),
            n_scanned_metadata,
        }
    }

    /// Runs the cooperative loop until `Quit` or the channel closes.
    /// Intended to be spawned on its own `std::thread`.
    pub fn run(mut self, to_scan: ScanReceiver) {
        loop {
            let first = match to_scan.recv_blocking() {
                Ok(msg) => msg,
                Err(_) => return,
            };
            if matches!(first, ToScan::Quit) {
                return;
            }
            let mut last_idle_token = None;
            if let Err(stop) = self.handle(first, &mut last_idle_token) {
                if stop {
                    return;
                }
            }

            while let Ok(msg) = to_scan.try_recv() {
                if matches!(msg, ToScan::Quit) {
                    return;
                }
                if let Err(stop) = self.handle(msg, &mut last_idle_token) {
                    if stop {
                        return;
                    }
                }
            }

            // The reply must land on `to_fetch` before this turn's
            // `ScanIdle`: if `ScanIdle` went first, the Main Loop would
            // treat it as a fresh idle signal, bump `idle_serial`, and
            // then find this reply's serial stale by the time it arrives,
            // so the two loops would ping-pong forever without ever
            // reaching quiescence.
            if let Some(serial) = last_idle_token.take() {
                let _ = self.to_fetch.send_blocking(ToFetch::MainIdleReply(serial));
            }
            let _ = self.to_fetch.send_blocking(ToFetch::ScanIdle);
        }
    }

    /// Handles one message. Returns `Err(true)` when a fatal error was
    /// raised and the worker should stop entirely.
    fn handle(&mut self, msg: ToScan, last_idle_token: &mut Option<u32>) -> Result<(), bool> {
        match msg {
            ToScan::Quit => Err(true),
            ToScan::MainIdle(serial) => {
                *last_idle_token = Some(serial);
                Ok(())
            }
            ToScan::Scan(name) => {
                if let Err(e) = self.classify(name, 0) {
                    let _ = self.errors.try_send(e);
                    return Err(true);
                }
                Ok(())
            }
        }
    }

    fn emit_fetch(&self, name: ObjectName) {
        let _ = self.to_fetch.send_blocking(ToFetch::Fetch(name));
    }

    /// `Classify(name)` per the design: recurse into an already-stored
    /// metadata object, or emit a fetch for a missing one. Only ever
    /// called with metadata names; FILE objects are fetched directly by
    /// `classify_dir_tree` and never recursed (invariant G2).
    fn classify(&mut self, name: ObjectName, depth: u32) -> PullResult<()> {
        debug_assert!(name.kind.is_meta(), "classify called with a non-metadata name");
        if depth > MAX_RECURSION {
            return Err(PullError::RecursionExceeded {
                name: name.to_string(),
                limit: MAX_RECURSION,
            });
        }
        if self.tables.scanned_metadata.contains(&name) {
            return Ok(());
        }

        let is_requested = self.tables.requested_metadata.contains(&name.csum);
        let is_stored = self.store.has_object(name.kind, &name.csum)?;

        if !is_stored {
            if !is_requested {
                self.tables.requested_metadata.insert(name.csum);
                self.emit_fetch(name);
            }
            return Ok(());
        }

        match name.kind {
            ObjectKind::Commit => self.classify_commit(name, depth)?,
            ObjectKind::DirTree => self.classify_dir_tree(name, depth)?,
            ObjectKind::DirMeta => {}
            ObjectKind::File => unreachable!("FILE objects are never classified"),
        }

        self.tables.scanned_metadata.insert(name);
        self.n_scanned_metadata.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn classify_commit(&mut self, name: ObjectName, depth: u32) -> PullResult<()> {
        let bytes = self.store.load_variant(name.kind, &name.csum)?;
        let commit = parse_commit(&bytes)?;

        self.classify(ObjectName::dir_tree(commit.tree_contents_csum), depth + 1)?;
        self.classify(ObjectName::dir_meta(commit.tree_meta_csum), depth + 1)?;

        if self.options.related {
            for (_relname, csum) in &commit.related {
                self.classify(ObjectName::commit(*csum), depth + 1)?;
            }
        }
        Ok(())
    }

    fn classify_dir_tree(&mut self, name: ObjectName, depth: u32) -> PullResult<()> {
        let bytes = self.store.load_variant(name.kind, &name.csum)?;
        let tree = parse_dir_tree(&bytes)?;

        for (filename, file_csum) in &tree.files {
            validate_name(filename)?;
            let stored = self.store.has_object(ObjectKind::File, file_csum)?;
            if !stored && !self.tables.requested_content.contains(file_csum) {
                self.tables.requested_content.insert(*file_csum);
                self.emit_fetch(ObjectName::file(*file_csum));
            }
        }

        for (dirname, tree_csum, meta_csum) in &tree.dirs {
            validate_name(dirname)?;
            self.classify(ObjectName::dir_tree(*tree_csum), depth + 1)?;
            self.classify(ObjectName::dir_meta(*meta_csum), depth + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeStore;
    use std::sync::atomic::AtomicU64;

    fn worker(store: Arc<FakeStore>, related: bool) -> (ScanWorker<FakeStore>, crate::queue::FetchReceiver) {
        let (to_fetch_tx, to_fetch_rx) = async_channel::unbounded();
        let (err_tx, _err_rx) = crate::queue::error_channel();
        let worker = ScanWorker::new(
            store,
            to_fetch_tx,
            err_tx,
            ScanOptions { related },
            Arc::new(AtomicU64::new(0)),
        );
        (worker, to_fetch_rx)
    }

    #[test]
    fn classify_emits_fetch_for_missing_metadata() {
        let store = Arc::new(FakeStore::new());
        let (mut w, rx) = worker(store, false);
        let csum = Checksum::from_bytes([9; 32]);
        w.classify(ObjectName::commit(csum), 0).unwrap();
        let msg = rx.try_recv().unwrap();
        assert!(matches!(msg, ToFetch::Fetch(n) if n == ObjectName::commit(csum)));
    }

    #[test]
    fn classify_recurses_into_stored_commit() {
        let store = Arc::new(FakeStore::new());
        let (commit_csum, file_csum) = store.seed_commit_with_one_file("f.txt", b"hello");
        let (mut w, rx) = worker(store.clone(), false);

        w.classify(ObjectName::commit(commit_csum), 0).unwrap();

        let mut fetched = Vec::new();
        while let Ok(ToFetch::Fetch(n)) = rx.try_recv() {
            fetched.push(n);
        }
        assert!(fetched.contains(&ObjectName::file(file_csum)));
        assert!(w.tables.scanned_metadata.contains(&ObjectName::commit(commit_csum)));
    }

    #[test]
    fn already_scanned_metadata_short_circuits() {
        let store = Arc::new(FakeStore::new());
        let (commit_csum, _) = store.seed_commit_with_one_file("f.txt", b"hi");
        let (mut w, _rx) = worker(store, false);
        w.classify(ObjectName::commit(commit_csum), 0).unwrap();
        let scanned_before = w.tables.scanned_metadata.len();
        w.classify(ObjectName::commit(commit_csum), 0).unwrap();
        assert_eq!(w.tables.scanned_metadata.len(), scanned_before);
    }

    #[test]
    fn deep_chain_triggers_recursion_exceeded() {
        let store = Arc::new(FakeStore::new());
        let head = store.seed_commit_chain(MAX_RECURSION as usize + 4);
        let (mut w, _rx) = worker(store, false);
        let err = w.classify(ObjectName::commit(head), 0).unwrap_err();
        assert!(matches!(err, PullError::RecursionExceeded { .. }));
    }

    #[test]
    fn bad_filename_in_tree_is_rejected() {
        let store = Arc::new(FakeStore::new());
        let commit_csum = store.seed_commit_with_bad_filename();
        let (mut w, _rx) = worker(store, false);
        let err = w.classify(ObjectName::commit(commit_csum), 0).unwrap_err();
        assert!(matches!(err, PullError::InvalidFilename(_)));
    }

    #[test]
    fn related_commit_only_walked_when_enabled() {
        let store = Arc::new(FakeStore::new());
        let (head, related) = store.seed_commit_with_related();

        let (mut w_off, _rx) = worker(store.clone(), false);
        w_off.classify(ObjectName::commit(head), 0).unwrap();
        assert!(!w_off.tables.scanned_metadata.contains(&ObjectName::commit(related)));

        let (mut w_on, _rx2) = worker(store, true);
        w_on.classify(ObjectName::commit(head), 0).unwrap();
        assert!(w_on.tables.scanned_metadata.contains(&ObjectName::commit(related)));
    }
}
