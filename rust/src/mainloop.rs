//! The Main Loop: a single-threaded cooperative event loop (on the Tokio
//! current/multi-thread executor) that owns the fetcher, drives every I/O
//! completion, and forwards freshly-staged metadata back to the Scan
//! Worker for recursion.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::content::parse_content_stream;
use crate::digest::{Checksum, ObjectKind, ObjectName};
use crate::error::{PullError, PullResult};
use crate::fetcher::{Fetcher, TempFile};
use crate::logging::Logger;
use crate::queue::{ErrorReceiver, FetchReceiver, ScanSender, ToFetch, ToScan};
use crate::quiescence::Quiescence;
use crate::store::Store;

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub n_outstanding_metadata_fetches: u64,
    pub n_outstanding_content_fetches: u64,
    pub n_outstanding_metadata_stage_requests: u64,
    pub n_outstanding_content_stage_requests: u64,
    pub n_requested_metadata: u64,
    pub n_requested_content: u64,
    pub n_fetched_metadata: u64,
    pub n_fetched_content: u64,
}

impl Counters {
    fn outstanding(&self) -> u64 {
        self.n_outstanding_metadata_fetches
            + self.n_outstanding_content_fetches
            + self.n_outstanding_metadata_stage_requests
            + self.n_outstanding_content_stage_requests
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MainLoopStats {
    pub n_fetched_metadata: u64,
    pub n_fetched_content: u64,
    pub n_requested_metadata: u64,
    pub n_requested_content: u64,
    pub bytes_transferred: u64,
}

enum TaskEvent {
    FetchCompleted {
        name: ObjectName,
        result: PullResult<TempFile>,
    },
    StageCompleted {
        name: ObjectName,
        result: PullResult<Checksum>,
    },
}

pub struct MainLoop<S: Store, F: Fetcher> {
    store: Arc<S>,
    fetcher: Arc<F>,
    base_url: String,
    to_scan: ScanSender,
    to_fetch: FetchReceiver,
    errors: ErrorReceiver,
    cancel: CancellationToken,
    logger: Arc<Logger>,
    quiescence: Quiescence,
    counters: Counters,
    task_tx: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl<S: Store, F: Fetcher> MainLoop<S, F> {
    pub fn new(
        store: Arc<S>,
        fetcher: Arc<F>,
        base_url: String,
        to_scan: ScanSender,
        to_fetch: FetchReceiver,
        errors: ErrorReceiver,
        cancel: CancellationToken,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            store,
            fetcher,
            base_url,
            to_scan,
            to_fetch,
            errors,
            cancel,
            logger,
            quiescence: Quiescence::new(),
            counters: Counters::default(),
            task_tx: None,
        }
    }

    pub async fn run(mut self) -> PullResult<MainLoopStats> {
        let serial = self.quiescence.prime();
        let _ = self.to_scan.send(ToScan::MainIdle(serial)).await;

        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<TaskEvent>();
        self.task_tx = Some(task_tx.clone());
        let mut captured_error: Option<PullError> = None;

        while captured_error.is_none() && !self.is_quiescent() {
            tokio::select! {
                biased;

                errored = self.errors.recv() => {
                    if let Ok(err) = errored {
                        self.logger.error(&format!("{err}"));
                        captured_error = Some(err);
                        self.cancel.cancel();
                    }
                }

                msg = self.to_fetch.recv() => {
                    match msg {
                        Ok(ToFetch::Fetch(name)) => self.dispatch_fetch(name),
                        Ok(ToFetch::ScanIdle) => self.on_scan_idle().await,
                        Ok(ToFetch::MainIdleReply(serial)) => self.quiescence.on_main_idle_reply(serial),
                        Err(_) => {
                            captured_error.get_or_insert(PullError::store(
                                "scan worker disconnected without reporting an error",
                            ));
                            self.cancel.cancel();
                        }
                    }
                }

                event = task_rx.recv() => {
                    if let Some(event) = event {
                        if let Err(e) = self.on_task_event(event).await {
                            self.logger.error(&format!("{e}"));
                            captured_error = Some(e);
                            self.cancel.cancel();
                        }
                    }
                }
            }

            self.logger.status(&format!(
                "scanning/fetching: {} outstanding, {} metadata fetched, {} content fetched ({})",
                self.counters.outstanding(),
                self.counters.n_fetched_metadata,
                self.counters.n_fetched_content,
                self.fetcher.state_summary(),
            ));
        }
        self.logger.clear_status();

        let _ = self.to_scan.send(ToScan::Quit).await;

        if let Some(e) = captured_error {
            return Err(e);
        }
        Ok(MainLoopStats {
            n_fetched_metadata: self.counters.n_fetched_metadata,
            n_fetched_content: self.counters.n_fetched_content,
            n_requested_metadata: self.counters.n_requested_metadata,
            n_requested_content: self.counters.n_requested_content,
            bytes_transferred: self.fetcher.bytes_transferred(),
        })
    }

    fn is_quiescent(&self) -> bool {
        self.quiescence.is_scan_idle() && self.counters.outstanding() == 0
    }

    async fn on_scan_idle(&mut self) {
        if let Some(serial) = self.quiescence.on_scan_idle() {
            let _ = self.to_scan.send(ToScan::MainIdle(serial)).await;
        }
    }

    fn dispatch_fetch(&mut self, name: ObjectName) {
        let uri = format!("{}/{}", self.base_url, self.store.object_relpath(&name));
        self.logger.trace(&format!("fetch {name} <- {uri}"));

        match name.kind {
            ObjectKind::File => {
                self.counters.n_outstanding_content_fetches += 1;
                self.counters.n_requested_content += 1;
            }
            _ => {
                self.counters.n_outstanding_metadata_fetches += 1;
                self.counters.n_requested_metadata += 1;
            }
        }

        let fetcher = self.fetcher.clone();
        let cancel = self.cancel.clone();
        let task_tx = self.task_tx();
        tokio::spawn(async move {
            let result = fetcher.request_uri(uri, cancel).await;
            let _ = task_tx.send(TaskEvent::FetchCompleted { name, result });
        });
    }

    async fn on_task_event(&mut self, event: TaskEvent) -> PullResult<()> {
        match event {
            TaskEvent::FetchCompleted { name, result } => {
                match name.kind {
                    ObjectKind::File => self.counters.n_outstanding_content_fetches -= 1,
                    _ => self.counters.n_outstanding_metadata_fetches -= 1,
                }
                let temp = result?;
                self.dispatch_stage(name, temp);
                Ok(())
            }
            TaskEvent::StageCompleted { name, result } => {
                match name.kind {
                    ObjectKind::File => self.counters.n_outstanding_content_stage_requests -= 1,
                    _ => self.counters.n_outstanding_metadata_stage_requests -= 1,
                }
                let actual = result?;
                if actual != name.csum {
                    return Err(PullError::ChecksumMismatch {
                        expected: name.csum.to_hex(),
                        actual: actual.to_hex(),
                    });
                }
                match name.kind {
                    ObjectKind::File => {
                        self.counters.n_fetched_content += 1;
                    }
                    _ => {
                        self.counters.n_fetched_metadata += 1;
                        self.logger.debug(&format!("staged {name}, recursing"));
                        let _ = self.to_scan.send(ToScan::Scan(name)).await;
                        self.quiescence.note_scan_emitted();
                    }
                }
                Ok(())
            }
        }
    }

    fn dispatch_stage(&mut self, name: ObjectName, temp: TempFile) {
        match name.kind {
            ObjectKind::File => self.counters.n_outstanding_content_stage_requests += 1,
            _ => self.counters.n_outstanding_metadata_stage_requests += 1,
        }

        let store = self.store.clone();
        let task_tx = self.task_tx();
        tokio::spawn(async move {
            let result = stage_one(&*store, name, temp).await;
            let _ = task_tx.send(TaskEvent::StageCompleted { name, result });
        });
    }

    fn task_tx(&self) -> mpsc::UnboundedSender<TaskEvent> {
        self.task_tx
            .clone()
            .expect("task_tx is set for the lifetime of run()")
    }
}

async fn stage_one<S: Store>(store: &S, name: ObjectName, temp: TempFile) -> PullResult<Checksum> {
    let path = temp.path().to_path_buf();
    let result = stage_one_inner(store, name, &path).await;
    let _ = temp.delete().await;
    result
}

async fn stage_one_inner<S: Store>(
    store: &S,
    name: ObjectName,
    path: &Path,
) -> PullResult<Checksum> {
    let bytes = tokio::fs::read(path).await?;
    if name.kind == ObjectKind::File {
        let content = parse_content_stream(&bytes)?;
        store.stage_content(content).await
    } else {
        store.stage_metadata(name.kind, bytes).await
    }
}

/// End-to-end tests driving the two-loop pipeline (Scan Worker thread +
/// Main Loop) against the in-process fakes, without going through the
/// orchestrator's ref-resolution HTTP phase. Mirrors the scenarios in
/// spec.md's end-to-end section.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::encode_content_stream;
    use crate::digest::content_checksum;
    use crate::queue::{channels, error_channel, ToScan};
    use crate::records::{encode_commit, encode_dir_tree, CommitRecord, DirTreeRecord, DIR_META_TAG};
    use crate::scan::{ScanOptions, ScanWorker};
    use crate::store::ContentInput;
    use crate::testutil::{dummy_file_info, FakeFetcher, FakeStore};
    use std::sync::atomic::AtomicU64;

    async fn run_pipeline(
        store: Arc<FakeStore>,
        fetcher: Arc<FakeFetcher>,
        base_url: &str,
        roots: Vec<ObjectName>,
        related: bool,
    ) -> PullResult<MainLoopStats> {
        let (to_scan_tx, to_scan_rx, to_fetch_tx, to_fetch_rx) = channels();
        let (err_tx, err_rx) = error_channel();
        let n_scanned = Arc::new(AtomicU64::new(0));

        for root in roots {
            to_scan_tx.send(ToScan::Scan(root)).await.unwrap();
        }

        let worker = ScanWorker::new(
            store.clone(),
            to_fetch_tx,
            err_tx,
            ScanOptions { related },
            n_scanned,
        );
        let worker_handle = std::thread::spawn(move || worker.run(to_scan_rx));

        let logger = Arc::new(Logger::new(0));
        let cancel = CancellationToken::new();
        let main_loop = MainLoop::new(
            store,
            fetcher,
            base_url.to_string(),
            to_scan_tx,
            to_fetch_rx,
            err_rx,
            cancel,
            logger,
        );
        let result = main_loop.run().await;
        tokio::task::spawn_blocking(move || worker_handle.join().unwrap())
            .await
            .unwrap();
        result
    }

    fn uri(base: &str, store: &FakeStore, name: ObjectName) -> String {
        format!("{base}/{}", store.object_relpath(&name))
    }

    fn serve_file(fetcher: &FakeFetcher, base: &str, store: &FakeStore, payload: &[u8]) -> Checksum {
        let csum = content_checksum(payload);
        let input = ContentInput {
            payload: payload.to_vec(),
            file_info: dummy_file_info(),
            xattrs: vec![],
        };
        fetcher.serve(
            uri(base, store, ObjectName::file(csum)),
            encode_content_stream(&input),
        );
        csum
    }

    /// Scenario 1: single branch, empty local store. Commit C0 -> tree T0
    /// (two files) + meta M0; all five objects must end up staged.
    #[tokio::test]
    async fn single_branch_empty_store_fetches_full_closure() {
        let store = Arc::new(FakeStore::new());
        let spool = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(spool.path().to_path_buf()));
        let base = "http://remote";

        let f1_csum = serve_file(&fetcher, base, &store, b"file one");
        let f2_csum = serve_file(&fetcher, base, &store, b"file two");

        let tree_rec = DirTreeRecord {
            files: vec![("f1.txt".into(), f1_csum), ("f2.txt".into(), f2_csum)],
            dirs: vec![],
        };
        let tree_bytes = encode_dir_tree(&tree_rec);
        let tree_csum = content_checksum(&tree_bytes);
        fetcher.serve(uri(base, &store, ObjectName::dir_tree(tree_csum)), tree_bytes);

        let meta_bytes = vec![DIR_META_TAG];
        let meta_csum = content_checksum(&meta_bytes);
        fetcher.serve(uri(base, &store, ObjectName::dir_meta(meta_csum)), meta_bytes);

        let commit_rec = CommitRecord {
            tree_contents_csum: tree_csum,
            tree_meta_csum: meta_csum,
            related: vec![],
        };
        let commit_bytes = encode_commit(&commit_rec);
        let commit_csum = content_checksum(&commit_bytes);
        fetcher.serve(uri(base, &store, ObjectName::commit(commit_csum)), commit_bytes);

        let stats = run_pipeline(
            store.clone(),
            fetcher,
            base,
            vec![ObjectName::commit(commit_csum)],
            false,
        )
        .await
        .unwrap();

        assert!(store.has_object(ObjectKind::Commit, &commit_csum).unwrap());
        assert!(store.has_object(ObjectKind::DirTree, &tree_csum).unwrap());
        assert!(store.has_object(ObjectKind::DirMeta, &meta_csum).unwrap());
        assert!(store.has_object(ObjectKind::File, &f1_csum).unwrap());
        assert!(store.has_object(ObjectKind::File, &f2_csum).unwrap());
        assert_eq!(stats.n_fetched_metadata, 3);
        assert_eq!(stats.n_fetched_content, 2);
    }

    /// Scenario 2: two branches whose trees share a file; the shared file
    /// must be fetched exactly once.
    #[tokio::test]
    async fn shared_file_across_two_roots_is_fetched_once() {
        let store = Arc::new(FakeStore::new());
        let spool = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(spool.path().to_path_buf()));
        let base = "http://remote";

        let shared_csum = serve_file(&fetcher, base, &store, b"shared contents");
        let shared_uri = uri(base, &store, ObjectName::file(shared_csum));

        let meta_bytes = vec![DIR_META_TAG];
        let meta_csum = content_checksum(&meta_bytes);
        fetcher.serve(uri(base, &store, ObjectName::dir_meta(meta_csum)), meta_bytes);

        let mut commit_csums = Vec::new();
        for name in ["f_a.txt", "f_b.txt"] {
            let tree_rec = DirTreeRecord {
                files: vec![(name.to_string(), shared_csum)],
                dirs: vec![],
            };
            let tree_bytes = encode_dir_tree(&tree_rec);
            let tree_csum = content_checksum(&tree_bytes);
            fetcher.serve(uri(base, &store, ObjectName::dir_tree(tree_csum)), tree_bytes);

            let commit_rec = CommitRecord {
                tree_contents_csum: tree_csum,
                tree_meta_csum: meta_csum,
                related: vec![],
            };
            let commit_bytes = encode_commit(&commit_rec);
            let commit_csum = content_checksum(&commit_bytes);
            fetcher.serve(uri(base, &store, ObjectName::commit(commit_csum)), commit_bytes);
            commit_csums.push(commit_csum);
        }

        let roots = commit_csums.iter().map(|c| ObjectName::commit(*c)).collect();
        let stats = run_pipeline(store.clone(), fetcher.clone(), base, roots, false)
            .await
            .unwrap();

        assert!(store.has_object(ObjectKind::File, &shared_csum).unwrap());
        assert_eq!(fetcher.call_count(&shared_uri), 1);
        assert_eq!(stats.n_fetched_content, 1);
    }

    /// Scenario 5: a broken fetch whose staged checksum doesn't match the
    /// expected one must surface as a fatal integrity error.
    #[tokio::test]
    async fn checksum_mismatch_is_fatal() {
        let store = Arc::new(FakeStore::new());
        let spool = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(spool.path().to_path_buf()));
        let base = "http://remote";

        let expected_csum = content_checksum(b"expected contents");
        let wrong_input = ContentInput {
            payload: b"wrong bytes entirely".to_vec(),
            file_info: dummy_file_info(),
            xattrs: vec![],
        };
        fetcher.serve(
            uri(base, &store, ObjectName::file(expected_csum)),
            encode_content_stream(&wrong_input),
        );

        let meta_bytes = vec![DIR_META_TAG];
        let meta_csum = content_checksum(&meta_bytes);
        fetcher.serve(uri(base, &store, ObjectName::dir_meta(meta_csum)), meta_bytes);

        let tree_rec = DirTreeRecord {
            files: vec![("f.txt".into(), expected_csum)],
            dirs: vec![],
        };
        let tree_bytes = encode_dir_tree(&tree_rec);
        let tree_csum = content_checksum(&tree_bytes);
        fetcher.serve(uri(base, &store, ObjectName::dir_tree(tree_csum)), tree_bytes);

        let commit_rec = CommitRecord {
            tree_contents_csum: tree_csum,
            tree_meta_csum: meta_csum,
            related: vec![],
        };
        let commit_bytes = encode_commit(&commit_rec);
        let commit_csum = content_checksum(&commit_bytes);
        fetcher.serve(uri(base, &store, ObjectName::commit(commit_csum)), commit_bytes);

        let err = run_pipeline(
            store.clone(),
            fetcher,
            base,
            vec![ObjectName::commit(commit_csum)],
            false,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PullError::ChecksumMismatch { .. }));
        assert!(!store.has_object(ObjectKind::File, &expected_csum).unwrap());
    }

    /// `--related` gates whether a commit's related-commit edges are
    /// walked by the pipeline end to end (not just inside `Classify`).
    #[tokio::test]
    async fn related_flag_controls_whether_related_commit_is_fetched() {
        let store = Arc::new(FakeStore::new());
        let spool = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(spool.path().to_path_buf()));
        let base = "http://remote";

        let meta_bytes = vec![DIR_META_TAG];
        let meta_csum = content_checksum(&meta_bytes);
        fetcher.serve(uri(base, &store, ObjectName::dir_meta(meta_csum)), meta_bytes.clone());

        let empty_tree = encode_dir_tree(&DirTreeRecord { files: vec![], dirs: vec![] });
        let empty_tree_csum = content_checksum(&empty_tree);
        fetcher.serve(
            uri(base, &store, ObjectName::dir_tree(empty_tree_csum)),
            empty_tree,
        );

        let related_rec = CommitRecord {
            tree_contents_csum: empty_tree_csum,
            tree_meta_csum: meta_csum,
            related: vec![],
        };
        let related_bytes = encode_commit(&related_rec);
        let related_csum = content_checksum(&related_bytes);
        fetcher.serve(uri(base, &store, ObjectName::commit(related_csum)), related_bytes);

        let head_rec = CommitRecord {
            tree_contents_csum: empty_tree_csum,
            tree_meta_csum: meta_csum,
            related: vec![("prev".into(), related_csum)],
        };
        let head_bytes = encode_commit(&head_rec);
        let head_csum = content_checksum(&head_bytes);
        fetcher.serve(uri(base, &store, ObjectName::commit(head_csum)), head_bytes);

        // Without --related: the related commit is never fetched.
        let store_off = Arc::new(FakeStore::new());
        let stats_off = run_pipeline(
            store_off.clone(),
            fetcher.clone(),
            base,
            vec![ObjectName::commit(head_csum)],
            false,
        )
        .await
        .unwrap();
        assert!(!store_off.has_object(ObjectKind::Commit, &related_csum).unwrap());
        assert_eq!(stats_off.n_fetched_metadata, 3); // head commit, its tree, its meta

        // With --related: it is.
        let store_on = Arc::new(FakeStore::new());
        run_pipeline(
            store_on.clone(),
            fetcher,
            base,
            vec![ObjectName::commit(head_csum)],
            true,
        )
        .await
        .unwrap();
        assert!(store_on.has_object(ObjectKind::Commit, &related_csum).unwrap());
    }
}
