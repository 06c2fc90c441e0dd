use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use pullctl::cli::Cli;
use pullctl::config::KeyFile;
use pullctl::fetcher::HttpFetcher;
use pullctl::fsstore::FsStore;
use pullctl::logging::Logger;
use pullctl::orchestrator::{self, PullRequest};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let logger = Arc::new(Logger::new(args.verbose));

    match run(args, logger.clone()).await {
        Ok(()) => {}
        Err(e) => {
            logger.error(&format!("{e}"));
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli, logger: Arc<Logger>) -> pullctl::error::PullResult<()> {
    let config_text = tokio::fs::read_to_string(args.repo.join("config")).await?;
    let local_config = KeyFile::parse(&config_text)?;

    let store = Arc::new(FsStore::new(args.repo.clone())?);
    let spool_dir = args.repo.join(".pull-tmp");
    let fetcher = Arc::new(HttpFetcher::new(spool_dir, args.concurrency)?);

    let http = reqwest::Client::builder()
        .user_agent(concat!("pullctl/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| pullctl::error::PullError::Network {
            uri: "<client-build>".into(),
            source: e,
        })?;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let req = PullRequest {
        remote: args.remote.clone(),
        args: args.refs,
        related: args.related,
    };

    logger.info(&format!("pulling from remote {:?}", args.remote));
    let outcome = orchestrator::run(req, store, fetcher, http, &local_config, logger.clone(), cancel).await?;

    for branch in &outcome.unchanged_refs {
        logger.info(&format!("{}/{branch}: no changes", args.remote));
    }
    for (branch, csum) in &outcome.updated_refs {
        logger.info(&format!("{}/{branch} -> {csum}", args.remote));
    }
    if let Some(stats) = outcome.stats {
        logger.info(&format!(
            "fetched {} metadata, {} content objects ({} bytes transferred)",
            stats.n_fetched_metadata, stats.n_fetched_content, stats.bytes_transferred
        ));
    }

    Ok(())
}
