mod config;
mod line_items;
mod llm;
mod lookup;
mod pipeline;
mod price;
mod rate_limit;
mod scoring;
mod supplier;
mod uom;
mod web;

use crate::llm::HttpLlmClient;
use crate::lookup::cache::LookupCache;
use crate::pipeline::{DocumentInput, Pipeline, ProcessOutcome};
use crate::rate_limit::RateLimiter;
use crate::web::HttpWebClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter("info")
        .init();

    let mut force = false;
    let mut config_path = String::from("invoice_enrich.toml");
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--force" => force = true,
            "--config" => {
                config_path = args.next().ok_or("--config requires a path")?;
            }
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }

    let cfg = config::Config::load_or_default(&config_path)?;

    // Shared infrastructure: one limiter and one cache across all workers.
    let limiter = Arc::new(RateLimiter::new(
        cfg.limits.rpm,
        cfg.limits.rpd,
        cfg.daily_counter_file(),
    ));
    let cache = Arc::new(LookupCache::new(cfg.cache_db_file())?);
    let web = Arc::new(HttpWebClient::new());
    let llm = Arc::new(HttpLlmClient::new(
        cfg.llm.clone(),
        cfg.limits.clone(),
        limiter.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(cfg.clone(), cache, web.clone(), web, llm));

    if !cfg.dirs.input.exists() {
        info!(input = %cfg.dirs.input.display(), "Input directory does not exist, nothing to do");
        return Ok(());
    }

    let mut docs: Vec<PathBuf> = std::fs::read_dir(&cfg.dirs.input)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    docs.sort();

    if docs.is_empty() {
        info!(input = %cfg.dirs.input.display(), "No extraction documents found");
        return Ok(());
    }
    info!(count = docs.len(), workers = cfg.workers, force, "Starting batch");

    // Cooperative stop: ctrl-c halts intake, in-flight documents finish.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stop requested, halting intake of new documents");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let semaphore = Arc::new(Semaphore::new(cfg.workers.max(1)));
    let mut workers = JoinSet::new();
    let mut completed = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for path in docs {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let pipeline = pipeline.clone();
        workers.spawn(async move {
            let _permit = permit;
            let doc = match DocumentInput::from_json_file(&path) {
                Ok(doc) => doc,
                Err(e) => {
                    error!(file = %path.display(), error = %e, "Unreadable extraction file");
                    return ProcessOutcome::Failed { stage: "extraction" };
                }
            };
            pipeline.process_document(&doc, force).await
        });
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(ProcessOutcome::Completed(result)) => {
                info!(
                    file = %result.file,
                    items = result.stats.num_items,
                    escalations = result.stats.num_escalations,
                    "DONE"
                );
                completed += 1;
            }
            Ok(ProcessOutcome::AlreadyProcessed) => skipped += 1,
            Ok(ProcessOutcome::Failed { stage }) => {
                error!(stage, "Document failed");
                failed += 1;
            }
            Err(e) => {
                error!(error = %e, "Worker task aborted");
                failed += 1;
            }
        }
    }

    info!(
        completed,
        skipped,
        failed,
        daily_llm_remaining = limiter.daily_remaining(),
        "Batch complete"
    );

    Ok(())
}
