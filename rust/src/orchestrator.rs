//! Orchestrator: the sequence that turns a parsed CLI invocation into a
//! finished pull — resolve roots, run the two-loop pipeline, commit and
//! update refs. Everything else in this crate is a component this module
//! wires together exactly once per invocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{validate_ref_name, KeyFile, RemoteConfig, RemoteServerConfig};
use crate::digest::{Checksum, ObjectName};
use crate::error::{PullError, PullResult};
use crate::fetcher::Fetcher;
use crate::logging::Logger;
use crate::mainloop::{MainLoop, MainLoopStats};
use crate::queue::{channels, error_channel, ToScan};
use crate::scan::{ScanOptions, ScanWorker};
use crate::store::Store;

/// A parsed `pull REMOTE [BRANCH|CHECKSUM...]` invocation.
pub struct PullRequest {
    pub remote: String,
    pub args: Vec<String>,
    pub related: bool,
}

pub struct PullOutcome {
    pub updated_refs: Vec<(String, Checksum)>,
    pub unchanged_refs: Vec<String>,
    /// `None` when every requested ref was already up to date and the
    /// scan/fetch pipeline never needed to run.
    pub stats: Option<MainLoopStats>,
}

/// Runs one pull to completion. `http` is a bare client used only for the
/// small ref-fetch phase (config/heads/summary); `fetcher` drives the
/// object pipeline proper.
pub async fn run<S: Store, F: Fetcher>(
    req: PullRequest,
    store: Arc<S>,
    fetcher: Arc<F>,
    http: reqwest::Client,
    local_config: &KeyFile,
    logger: Arc<Logger>,
    cancel: CancellationToken,
) -> PullResult<PullOutcome> {
    let remote_cfg = RemoteConfig::load(local_config, &req.remote)?;
    let base_url = remote_cfg.url.trim_end_matches('/').to_string();

    let config_text = fetch_text(&http, &format!("{base_url}/config"), &cancel).await?;
    let server_cfg = RemoteServerConfig::parse(&config_text)?;
    server_cfg.require_archived()?;
    logger.debug(&format!(
        "remote {:?} storage mode: {}",
        req.remote, server_cfg.raw_mode
    ));

    let mut raw_roots: Vec<Checksum> = Vec::new();
    let mut branch_args: Vec<String> = Vec::new();
    for arg in &req.args {
        match Checksum::parse(arg) {
            Ok(csum) => raw_roots.push(csum),
            Err(_) => {
                validate_ref_name(arg)?;
                branch_args.push(arg.clone());
            }
        }
    }

    let mut requested_refs: Vec<(String, Checksum)> = Vec::new();
    if req.args.is_empty() {
        if !remote_cfg.branches.is_empty() {
            branch_args = remote_cfg.branches.clone();
        } else {
            let summary_text =
                fetch_text(&http, &format!("{base_url}/refs/summary"), &cancel).await?;
            for (csum, branch) in parse_summary(&summary_text)? {
                requested_refs.push((branch, csum));
            }
        }
    }
    if !branch_args.is_empty() {
        requested_refs.extend(fetch_branch_heads(&http, &base_url, &branch_args, &cancel).await?);
    }

    let mut roots = raw_roots;
    let mut to_update: Vec<(String, Checksum)> = Vec::new();
    let mut unchanged_refs: Vec<String> = Vec::new();
    for (branch, new_csum) in requested_refs {
        let key = format!("{}/{}", req.remote, branch);
        if store.resolve_rev(&key)?.as_ref() == Some(&new_csum) {
            logger.info(&format!("No changes in {key}"));
            unchanged_refs.push(branch);
            continue;
        }
        roots.push(new_csum);
        to_update.push((branch, new_csum));
    }

    if roots.is_empty() {
        return Ok(PullOutcome {
            updated_refs: Vec::new(),
            unchanged_refs,
            stats: None,
        });
    }

    store.prepare_transaction()?;

    let (to_scan_tx, to_scan_rx, to_fetch_tx, to_fetch_rx) = channels();
    let (err_tx, err_rx) = error_channel();
    let n_scanned_metadata = Arc::new(AtomicU64::new(0));

    for csum in &roots {
        let _ = to_scan_tx
            .send(ToScan::Scan(ObjectName::commit(*csum)))
            .await;
    }

    let worker = ScanWorker::new(
        store.clone(),
        to_fetch_tx,
        err_tx,
        ScanOptions {
            related: req.related,
        },
        n_scanned_metadata.clone(),
    );
    let worker_handle = std::thread::spawn(move || worker.run(to_scan_rx));

    let main_loop = MainLoop::new(
        store.clone(),
        fetcher,
        base_url,
        to_scan_tx,
        to_fetch_rx,
        err_rx,
        cancel,
        logger.clone(),
    );
    let result = main_loop.run().await;

    if worker_handle.join().is_err() {
        logger.error("scan worker thread panicked");
    }

    let stats = result?;
    store.commit_transaction()?;
    for (branch, csum) in &to_update {
        store.write_ref(&req.remote, branch, csum)?;
    }
    logger.info(&format!(
        "scanned {} metadata objects",
        n_scanned_metadata.load(Ordering::Relaxed)
    ));

    Ok(PullOutcome {
        updated_refs: to_update,
        unchanged_refs,
        stats: Some(stats),
    })
}

async fn fetch_text(
    http: &reqwest::Client,
    url: &str,
    cancel: &CancellationToken,
) -> PullResult<String> {
    let net_err = |e: reqwest::Error| PullError::Network {
        uri: url.to_string(),
        source: e,
    };
    let send = http.get(url).send();
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PullError::Cancelled),
        r = send => r.map_err(net_err)?,
    };
    let resp = resp.error_for_status().map_err(net_err)?;
    let text = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PullError::Cancelled),
        t = resp.text() => t.map_err(net_err)?,
    };
    Ok(text)
}

/// Fetches every branch head concurrently; the ref-fetch phase's own
/// termination is simply "every spawned request has returned".
async fn fetch_branch_heads(
    http: &reqwest::Client,
    base_url: &str,
    branches: &[String],
    cancel: &CancellationToken,
) -> PullResult<Vec<(String, Checksum)>> {
    let mut handles = Vec::with_capacity(branches.len());
    for branch in branches {
        let http = http.clone();
        let url = format!("{base_url}/refs/heads/{branch}");
        let cancel = cancel.clone();
        let branch = branch.clone();
        handles.push(tokio::spawn(async move {
            let text = fetch_text(&http, &url, &cancel).await?;
            let csum = Checksum::parse(text.trim())?;
            Ok::<_, PullError>((branch, csum))
        }));
    }
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = handle
            .await
            .map_err(|e| PullError::store(format!("ref-fetch task panicked: {e}")))?;
        out.push(result?);
    }
    Ok(out)
}

/// Grammar: one `"{checksum} {refname}"` per non-empty line, exactly one
/// space per line.
fn parse_summary(text: &str) -> PullResult<Vec<(Checksum, String)>> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if line.matches(' ').count() != 1 {
            return Err(PullError::MalformedSummaryLine(line.to_string()));
        }
        let (csum_str, name) = line.split_once(' ').expect("checked above");
        let csum = Checksum::parse(csum_str)
            .map_err(|_| PullError::MalformedSummaryLine(line.to_string()))?;
        validate_ref_name(name).map_err(|_| PullError::MalformedSummaryLine(line.to_string()))?;
        out.push((csum, name.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_parses_valid_lines() {
        let csum = "a".repeat(64);
        let text = format!("{csum} main\n\n{csum} dev\n");
        let parsed = parse_summary(&text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].1, "main");
        assert_eq!(parsed[1].1, "dev");
    }

    #[test]
    fn summary_rejects_line_without_space() {
        assert!(parse_summary("deadbeef\n").is_err());
    }

    #[test]
    fn summary_rejects_invalid_checksum() {
        assert!(parse_summary("nothex main\n").is_err());
    }

    #[test]
    fn summary_rejects_extra_space() {
        let csum = "a".repeat(64);
        assert!(parse_summary(&format!("{csum} weird name\n")).is_err());
    }
}
