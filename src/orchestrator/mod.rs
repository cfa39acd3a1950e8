//! The pipeline state machine.
//!
//! The orchestrator subscribes to every lifecycle event and drives the
//! closed loop:
//!
//! ```text
//!   job.submitted
//!     → figma.parse.requested
//!     ← figma.parsed
//!     → [for each platform] codegen.requested (screen 0)
//!     ← codegen.complete
//!     → sandbox.build.requested
//!     ← sandbox.ready
//!     → diff.requested
//!     ← diff.complete
//!       if passed   → notify.requested + screen.done (+ next screen)
//!       if refining → codegen.requested (iteration + 1)
//!       if max iter → screen.done with the last observed score
//!     → job.done (when all screens × platforms complete)
//! ```
//!
//! Worker failures advance the affected unit with a zero score; only a
//! design-parse failure fails the whole job. Handlers never terminate the
//! process; errors become nack decisions in the consume loop.

mod handlers;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::Consumer;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{self, AppState};
use crate::bus::{Broker, EventPublisher};
use crate::config::Config;
use crate::errors::{BusError, HandlerError};
use crate::events::{self, DiffResult, LogEvent, LogLevel, Platform, Screen};
use crate::hub::Hub;
use crate::registry::{AdvanceOutcome, JobRegistry, UnitKey};
use crate::store::Store;

/// Grace period for in-flight work after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The events the orchestrator consumes, one durable queue each.
#[derive(Debug, Clone, Copy)]
enum Subscription {
    JobSubmitted,
    FigmaParsed,
    FigmaFailed,
    CodegenComplete,
    CodegenFailed,
    SandboxReady,
    SandboxFailed,
    DiffComplete,
    DiffFailed,
    LogRelay,
}

const SUBSCRIPTIONS: &[(&str, &str, Subscription)] = &[
    ("orch.job.submitted", events::JOB_SUBMITTED, Subscription::JobSubmitted),
    ("orch.figma.parsed", events::FIGMA_PARSED, Subscription::FigmaParsed),
    ("orch.figma.failed", events::FIGMA_FAILED, Subscription::FigmaFailed),
    ("orch.codegen.complete", events::CODEGEN_COMPLETE, Subscription::CodegenComplete),
    ("orch.codegen.failed", events::CODEGEN_FAILED, Subscription::CodegenFailed),
    ("orch.sandbox.ready", events::SANDBOX_READY, Subscription::SandboxReady),
    ("orch.sandbox.failed", events::SANDBOX_FAILED, Subscription::SandboxFailed),
    ("orch.diff.complete", events::DIFF_COMPLETE, Subscription::DiffComplete),
    ("orch.diff.failed", events::DIFF_FAILED, Subscription::DiffFailed),
    // Forward all log-pattern messages to the live feed.
    ("orch.log.relay", "log.#", Subscription::LogRelay),
];

pub struct Orchestrator {
    cfg: Config,
    publisher: Arc<dyn EventPublisher>,
    hub: Hub,
    store: Store,
    registry: Arc<JobRegistry>,
    /// Job ids that already produced one unknown-job error; later events for
    /// them are dropped instead of requeued.
    unknown_jobs: Mutex<HashSet<String>>,
    /// Poison messages dropped after their retry.
    malformed_dropped: AtomicU64,
}

impl Orchestrator {
    pub fn new(cfg: Config, publisher: Arc<dyn EventPublisher>, hub: Hub, store: Store) -> Self {
        Self {
            cfg,
            publisher,
            hub,
            store,
            registry: Arc::new(JobRegistry::new()),
            unknown_jobs: Mutex::new(HashSet::new()),
            malformed_dropped: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Start the API server and every consumer, then block until `shutdown`
    /// fires or the bus dies. All tasks share the cancellation token.
    pub async fn run(self: &Arc<Self>, broker: &Broker, shutdown: CancellationToken) -> Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // HTTP ingress + live feed.
        let state = Arc::new(AppState {
            registry: self.registry(),
            publisher: Arc::clone(&self.publisher),
            hub: self.hub.clone(),
            default_threshold: self.cfg.default_threshold,
        });
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.cfg.api_port))
            .await
            .with_context(|| format!("bind API port {}", self.cfg.api_port))?;
        info!(port = self.cfg.api_port, "API listening");
        let app = api::build_router(state);
        let api_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
                .await;
            if let Err(err) = served {
                error!(error = %err, "API server error");
            }
        }));

        // One consumer task per subscription.
        for &(queue, pattern, kind) in SUBSCRIPTIONS {
            let consumer = broker.subscribe(queue, pattern).await?;
            let orchestrator = Arc::clone(self);
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = orchestrator.consume(queue, consumer, kind, token.clone()).await {
                    error!(queue, error = %err, "consumer stopped");
                    // A dead delivery stream is unrecoverable in-process;
                    // bring the whole orchestrator down for a restart.
                    token.cancel();
                }
            }));
        }

        shutdown.cancelled().await;
        info!("shutting down, draining in-flight handlers");
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("task did not drain within grace period, aborting");
                abort.abort();
            }
        }
        Ok(())
    }

    /// Generic delivery loop: one message at a time, ack on success, nack
    /// with a classified requeue flag on failure.
    async fn consume(
        &self,
        queue: &'static str,
        mut consumer: Consumer,
        kind: Subscription,
        shutdown: CancellationToken,
    ) -> Result<(), BusError> {
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => return Err(BusError::Channel(err)),
                    None => return Err(BusError::ConsumerClosed { queue: queue.to_string() }),
                },
            };

            match self.dispatch(kind, &delivery.data).await {
                Ok(()) => {
                    if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                        warn!(queue, error = %err, "ack failed");
                    }
                }
                Err(err) => {
                    let requeue = self.classify(&err, delivery.redelivered);
                    error!(
                        key = delivery.routing_key.as_str(),
                        requeue,
                        error = %err,
                        "handler error"
                    );
                    if !requeue {
                        if let HandlerError::Malformed(_) = err {
                            let dropped =
                                self.malformed_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!(total_dropped = dropped, "poison message dropped");
                        }
                    }
                    let nack = delivery
                        .nack(BasicNackOptions {
                            requeue,
                            ..Default::default()
                        })
                        .await;
                    if let Err(err) = nack {
                        warn!(queue, error = %err, "nack failed");
                    }
                }
            }
        }
    }

    async fn dispatch(&self, kind: Subscription, body: &[u8]) -> Result<(), HandlerError> {
        match kind {
            Subscription::JobSubmitted => self.on_job_submitted(body).await,
            Subscription::FigmaParsed => self.on_figma_parsed(body).await,
            Subscription::FigmaFailed => self.on_figma_failed(body).await,
            Subscription::CodegenComplete => self.on_codegen_complete(body).await,
            Subscription::CodegenFailed => self.on_codegen_failed(body).await,
            Subscription::SandboxReady => self.on_sandbox_ready(body).await,
            Subscription::SandboxFailed => self.on_sandbox_failed(body).await,
            Subscription::DiffComplete => self.on_diff_complete(body).await,
            Subscription::DiffFailed => self.on_diff_failed(body).await,
            Subscription::LogRelay => self.on_log_relay(body).await,
        }
    }

    /// Requeue decision for a failed handler. Unknown jobs get one retry per
    /// job id (the event may have raced the submission), malformed payloads
    /// one retry per delivery, bus hiccups always requeue.
    fn classify(&self, err: &HandlerError, redelivered: bool) -> bool {
        let first_unknown = match err {
            HandlerError::UnknownJob { job_id } => {
                self.unknown_jobs.lock().unwrap().insert(job_id.clone())
            }
            _ => false,
        };
        err.requeue(redelivered, first_unknown)
    }

    // ── Publish helpers ───────────────────────────────────────────────

    /// Wrap and publish a payload on the bus.
    async fn publish<T: serde::Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), HandlerError> {
        let body = events::wrap(routing_key, payload).map_err(|source| {
            HandlerError::Bus(BusError::Encode {
                routing_key: routing_key.to_string(),
                source,
            })
        })?;
        self.publisher
            .publish(routing_key, body)
            .await
            .map_err(HandlerError::Bus)
    }

    /// Emit a pipeline log line three ways: the local tracing stream, the
    /// bus (`log.event`, so peer services can observe), and straight into
    /// the live-feed hub so UIs skip the bus round-trip.
    async fn emit_log(
        &self,
        job_id: &str,
        level: LogLevel,
        step: &str,
        message: String,
        data: Option<serde_json::Value>,
    ) {
        match level {
            LogLevel::Error => error!(job = job_id, step, "{}", message),
            LogLevel::Warn => warn!(job = job_id, step, "{}", message),
            _ => info!(job = job_id, step, "{}", message),
        }
        let payload = LogEvent {
            job_id: job_id.to_string(),
            level,
            step: step.to_string(),
            message,
            data,
        };
        if let Err(err) = self.publish(events::LOG_EVENT, &payload).await {
            debug!(error = %err, "log.event publish skipped");
        }
        if let Ok(json) = serde_json::to_string(&payload) {
            self.hub.broadcast_raw(json);
        }
    }

    // ── Pipeline steps ────────────────────────────────────────────────

    /// Ask the code generator for one iteration of one unit.
    async fn request_codegen(
        &self,
        job_id: &str,
        screen_index: usize,
        platform: Platform,
        screen: Screen,
        prev_diff: Option<DiffResult>,
        iteration: u32,
    ) -> Result<(), HandlerError> {
        let (threshold, repo_context) = self
            .registry
            .codegen_params(job_id)
            .unwrap_or((self.cfg.default_threshold, String::new()));

        self.emit_log(
            job_id,
            LogLevel::Info,
            "codegen_start",
            format!(
                "[{}] iter {} — generating {}…",
                platform, iteration, screen.name
            ),
            None,
        )
        .await;

        self.publish(
            events::CODEGEN_REQUESTED,
            &events::CodegenRequested {
                job_id: job_id.to_string(),
                screen_index,
                screen,
                platform,
                styling: "tailwind".to_string(),
                repo_context,
                prev_diff,
                iteration,
                threshold,
            },
        )
        .await
    }

    /// Mark a unit terminal, then either chain the next screen on the same
    /// platform or finish the whole job. Duplicate terminal events for a
    /// unit are ignored.
    async fn advance_or_complete(
        &self,
        job_id: &str,
        screen_index: usize,
        platform: Platform,
        score: f64,
        iterations: u32,
    ) -> Result<(), HandlerError> {
        let key = UnitKey {
            screen_index,
            platform,
        };
        let info = match self.registry.advance(job_id, key, score, iterations) {
            AdvanceOutcome::Advanced(info) => info,
            AdvanceOutcome::UnknownJob => {
                // Job already finalized; late worker events have nothing
                // left to advance.
                debug!(job = job_id, "advance for unknown job ignored");
                return Ok(());
            }
            AdvanceOutcome::UnknownUnit | AdvanceOutcome::AlreadyDone => {
                debug!(
                    job = job_id,
                    screen_index,
                    platform = %platform,
                    "duplicate or unknown unit advance ignored"
                );
                return Ok(());
            }
        };

        if let Some(screen_name) = info.screen_name {
            self.publish(
                events::SCREEN_DONE,
                &events::ScreenDone {
                    job_id: job_id.to_string(),
                    screen_index,
                    screen_name,
                    platform,
                    score,
                    iterations,
                },
            )
            .await?;
        }

        if let Some(next_screen) = info.next_screen {
            self.request_codegen(job_id, screen_index + 1, platform, next_screen, None, 1)
                .await?;
        }

        if info.completed >= info.total_work {
            self.complete_job(job_id).await?;
        }
        Ok(())
    }

    /// Final rollup: remove the job, persist, publish `job.done`.
    async fn complete_job(&self, job_id: &str) -> Result<(), HandlerError> {
        let summary = match self.registry.remove(job_id) {
            Some(summary) => summary,
            None => return Ok(()),
        };

        self.emit_log(
            job_id,
            LogLevel::Success,
            "job_done",
            format!(
                "🎉 Job complete! {} screens × {} platforms | avg score: {:.1}% | {} total iterations",
                summary.screens,
                summary.platforms.len(),
                summary.avg_score,
                summary.total_iter
            ),
            None,
        )
        .await;

        if let Err(err) = self.store.mark_job_done(job_id).await {
            debug!(job = job_id, error = %err, "store write skipped");
        }

        self.publish(
            events::JOB_DONE,
            &events::JobDone {
                job_id: job_id.to_string(),
                screens: summary.screens,
                platforms: summary.platforms,
                avg_score: summary.avg_score,
                total_iter: summary.total_iter,
            },
        )
        .await
    }

    /// Ask for a sandbox teardown. The sandbox service owns container
    /// lifetimes; this is an acknowledgement, not a guarantee.
    fn kill_sandbox(&self, container_id: &str) {
        debug!(container = container_id, "requesting sandbox teardown");
    }
}
