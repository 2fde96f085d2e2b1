mod logging;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Result};
use foundry_agent::{GitHubWorker, LlmAnalyst, LlmJudge, LlmReviewer, OllamaChat};
use foundry_core::{
    agent::SourceTree,
    config::Config,
    containment::{ContainmentGuard, GuidanceStore},
    entropy::{Threshold, UncertaintyDetector},
    git::GitTree,
    lifecycle::TaskLifecycle,
    pipeline::{LifecycleEvent, LogRing, Pipeline, PipelineSettings},
    retro::GuidanceOptimizer,
    sandbox::{ProcessSandbox, SandboxMode},
    source::FsTree,
    store::StateStore,
    types::Ticket,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use crate::logging::RingLayer;

const LOG_RING_CAPACITY: usize = 500;

const USAGE: &str = "usage: foundry [run | enqueue <tickets.json> | resume | status]";

fn init_tracing(config: &Config, ring: LogRing) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "foundry=info,foundry_core=info,foundry_agent=info".into());
    let ring = RingLayer {
        ring,
        capacity: LOG_RING_CAPACITY,
    };
    let registry = tracing_subscriber::registry().with(filter).with(ring);
    if config.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_pipeline(config: &Config, ring: LogRing, sandbox_mode: SandboxMode) -> Result<(Pipeline, broadcast::Receiver<LifecycleEvent>)> {
    let store = StateStore::new(&config.state_path).with_seed(&config.seed_state_path);

    let guard = ContainmentGuard::create(&config.containment_root)
        .with_context(|| format!("cannot open guidance root {}", config.containment_root))?;
    let guidance = GuidanceStore::new(guard);

    let source: Arc<dyn SourceTree> = if config.source_rev.is_empty() {
        Arc::new(FsTree::new(&config.source_root))
    } else {
        Arc::new(GitTree::new(config.source_root.clone(), config.source_rev.clone()))
    };

    let sandbox = ProcessSandbox::new(sandbox_mode, config.test_cmd.clone())
        .with_image(config.sandbox_image.clone())
        .with_seed_root(&config.source_root);

    let worker = GitHubWorker::new(
        config.github_token.clone(),
        config.github_repository.clone(),
        config.worker_username.clone(),
    )
    .with_guidance(guidance.clone());

    let judge = LlmJudge::new(OllamaChat::new(config.ollama_url.clone(), config.judge_model.clone()));
    let reviewer_chat = OllamaChat::new(config.ollama_url.clone(), config.reviewer_model.clone());
    let reviewer = LlmReviewer::new(reviewer_chat.clone()).with_guidance(guidance.clone());
    let analyst = LlmAnalyst::new(reviewer_chat);

    let detector = UncertaintyDetector::new(Arc::new(judge))
        .with_sample_size(config.entropy_samples)
        .with_temperature(config.entropy_temperature)
        .with_threshold(Threshold::FractionOfMax(config.entropy_threshold_ratio));

    let lifecycle = TaskLifecycle::new(Arc::new(worker), Arc::new(sandbox), Arc::new(reviewer), source, detector)
        .with_poll_interval(config.poll_interval());

    let settings = PipelineSettings {
        max_retries: config.max_retries,
        sprint_size: config.sprint_size,
    };
    let (pipeline, rx) = Pipeline::open(store, lifecycle, settings);
    let pipeline = pipeline
        .with_log_ring(ring)
        .with_retrospective(Arc::new(analyst), GuidanceOptimizer::new(guidance));
    Ok((pipeline, rx))
}

/// Mirror lifecycle events into the log until the pipeline goes away.
async fn log_events(mut rx: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => info!(
                kind = event.kind(),
                ticket = event.ticket_id(),
                "{}",
                event.message()
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event logger lagged, {n} events dropped"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn load_tickets(path: &str) -> Result<Vec<Ticket>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("{path} is not a JSON array of tickets"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let ring: LogRing = Arc::new(Mutex::new(VecDeque::new()));
    init_tracing(&config, ring.clone());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");

    let sandbox_mode = if command == "run" {
        SandboxMode::detect(&config.sandbox_backend).await
    } else {
        SandboxMode::Direct
    };
    let (mut pipeline, rx) = build_pipeline(&config, ring, sandbox_mode.clone())?;

    match command {
        "enqueue" => {
            let Some(path) = args.get(1) else {
                bail!("{USAGE}");
            };
            let mut added = 0;
            for ticket in load_tickets(path)? {
                let id = ticket.id.clone();
                if pipeline.enqueue(ticket)? {
                    added += 1;
                } else {
                    warn!(ticket = %id, "already in the backlog, skipped");
                }
            }
            info!("{added} tickets enqueued");
        }
        "resume" => {
            pipeline.resume()?;
            info!("operator resume recorded");
        }
        "status" => {
            println!("{}", serde_json::to_string_pretty(pipeline.state())?);
        }
        "run" => {
            if config.github_repository.is_empty() || config.github_token.is_empty() {
                bail!("GITHUB_REPOSITORY and GITHUB_TOKEN must be set");
            }
            info!(
                repository = %config.github_repository,
                sandbox = ?sandbox_mode,
                max_retries = config.max_retries,
                "foundry started"
            );
            tokio::spawn(log_events(rx));
            tokio::select! {
                res = pipeline.run(config.tick_interval()) => {
                    if let Err(e) = res {
                        error!("pipeline stopped: {e:#}");
                        return Err(e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, state is persisted after every step");
                }
            }
        }
        _ => bail!("{USAGE}"),
    }
    Ok(())
}
