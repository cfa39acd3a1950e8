//! Event handlers. Each corresponds to one subscription; all state changes
//! go through the registry, all follow-on work is published back to the bus.

use tracing::debug;

use super::Orchestrator;
use crate::errors::HandlerError;
use crate::events::{
    self, CodegenComplete, CodegenFailed, DiffComplete, DiffFailed, FigmaFailed,
    FigmaParseRequested, FigmaParsed, JobFailed, JobSubmitted, LogLevel, NotifyRequested,
    SandboxBuildRequested, SandboxFailed, SandboxReady,
};
use crate::registry::UnitKey;

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, HandlerError> {
    events::unwrap(body).map_err(HandlerError::Malformed)
}

impl Orchestrator {
    pub(super) async fn on_job_submitted(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: JobSubmitted = decode(body)?;

        let platforms: Vec<&str> = p.platforms.iter().map(|platform| platform.as_str()).collect();
        self.emit_log(
            &p.job_id,
            LogLevel::Info,
            "job_submitted",
            format!("Job received — platforms: [{}]", platforms.join(", ")),
            None,
        )
        .await;

        self.registry.insert(
            &p.job_id,
            p.platforms.clone(),
            p.threshold,
            p.repo_url.clone().unwrap_or_default(),
        );

        if let Err(err) = self.store.create_job(&p).await {
            debug!(job = %p.job_id, error = %err, "store write skipped");
        }

        self.publish(
            events::FIGMA_PARSE_REQUESTED,
            &FigmaParseRequested {
                job_id: p.job_id,
                design_url: p.design_url,
            },
        )
        .await
    }

    pub(super) async fn on_figma_parsed(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: FigmaParsed = decode(body)?;

        let fan_out = self
            .registry
            .set_screens(&p.job_id, p.screens)
            .ok_or_else(|| HandlerError::UnknownJob {
                job_id: p.job_id.clone(),
            })?;

        self.emit_log(
            &p.job_id,
            LogLevel::Success,
            "figma_parsed",
            format!("✓ {} screens detected: {}", p.screen_count, p.file_name),
            Some(serde_json::json!({
                "screens": p.screen_count,
                "platforms": fan_out.platforms,
            })),
        )
        .await;

        if let Err(err) = self.store.update_screen_count(&p.job_id, p.screen_count).await {
            debug!(job = %p.job_id, error = %err, "store write skipped");
        }

        // Fan out codegen for screen 0 on every platform. Screens run
        // sequentially per platform, platforms in parallel.
        let first_screen = match fan_out.first_screen {
            Some(screen) => screen,
            None => return self.complete_job(&p.job_id).await,
        };
        for platform in fan_out.platforms {
            self.request_codegen(&p.job_id, 0, platform, first_screen.clone(), None, 1)
                .await?;
        }
        Ok(())
    }

    pub(super) async fn on_figma_failed(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: FigmaFailed = decode(body)?;

        self.emit_log(
            &p.job_id,
            LogLevel::Error,
            "figma_failed",
            format!("Figma parse failed: {}", p.error),
            None,
        )
        .await;

        if let Err(err) = self.store.mark_job_failed(&p.job_id, &p.error).await {
            debug!(job = %p.job_id, error = %err, "store write skipped");
        }

        self.publish(
            events::JOB_FAILED,
            &JobFailed {
                job_id: p.job_id.clone(),
                error: p.error,
                step: "figma_parse".to_string(),
            },
        )
        .await?;

        // Nothing to work on; forget the job.
        self.registry.remove(&p.job_id);
        Ok(())
    }

    pub(super) async fn on_codegen_complete(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: CodegenComplete = decode(body)?;

        self.emit_log(
            &p.job_id,
            LogLevel::Info,
            "codegen_complete",
            format!(
                "[{}] iter {} — code generated ({} bytes)",
                p.platform,
                p.iteration,
                p.code.len()
            ),
            None,
        )
        .await;

        self.publish(
            events::SANDBOX_BUILD_REQUESTED,
            &SandboxBuildRequested {
                job_id: p.job_id,
                screen_index: p.screen_index,
                platform: p.platform,
                iteration: p.iteration,
                code: p.code,
                filename: p.filename,
                threshold: p.threshold,
                screen: p.screen,
            },
        )
        .await
    }

    pub(super) async fn on_codegen_failed(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: CodegenFailed = decode(body)?;
        self.emit_log(
            &p.job_id,
            LogLevel::Error,
            "codegen_failed",
            format!("[{}] codegen error: {}", p.platform, p.error),
            None,
        )
        .await;
        // A worker failure only skips this screen×platform, not the job.
        self.advance_or_complete(&p.job_id, p.screen_index, p.platform, 0.0, 0)
            .await
    }

    pub(super) async fn on_sandbox_ready(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: SandboxReady = decode(body)?;

        self.emit_log(
            &p.job_id,
            LogLevel::Info,
            "sandbox_ready",
            format!("[{}] sandbox running on port {}", p.platform, p.port),
            None,
        )
        .await;

        self.publish(
            events::DIFF_REQUESTED,
            &events::DiffRequested {
                job_id: p.job_id,
                screen_index: p.screen_index,
                platform: p.platform,
                iteration: p.iteration,
                sandbox_url: p.url,
                container_id: p.container_id,
                figma_export_url: p.screen.reference_image_url.clone(),
                screen: p.screen,
                threshold: p.threshold,
            },
        )
        .await
    }

    pub(super) async fn on_sandbox_failed(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: SandboxFailed = decode(body)?;
        self.emit_log(
            &p.job_id,
            LogLevel::Warn,
            "sandbox_failed",
            format!("[{}] build failed — skipping: {}", p.platform, p.error),
            None,
        )
        .await;
        self.advance_or_complete(&p.job_id, p.screen_index, p.platform, 0.0, 0)
            .await
    }

    /// The heart of the self-healing loop: pass, give up, or refine.
    pub(super) async fn on_diff_complete(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: DiffComplete = decode(body)?;
        let passed = p.diff.score >= f64::from(p.threshold);

        self.emit_log(
            &p.job_id,
            if passed { LogLevel::Success } else { LogLevel::Warn },
            "diff_result",
            format!(
                "[{}] iter {} — score: {:.1}% (layout:{:.0}% typo:{:.0}% spacing:{:.0}% color:{:.0}%)",
                p.platform, p.iteration, p.diff.score, p.diff.layout, p.diff.typography,
                p.diff.spacing, p.diff.color
            ),
            Some(serde_json::json!({"score": p.diff.score, "passed": passed})),
        )
        .await;

        let key = UnitKey {
            screen_index: p.screen_index,
            platform: p.platform,
        };
        let best_score = self
            .registry
            .record_iteration(&p.job_id, key, p.iteration, p.diff.score)
            .ok_or_else(|| HandlerError::UnknownJob {
                job_id: p.job_id.clone(),
            })?;

        // The sandbox served its purpose either way.
        self.kill_sandbox(&p.container_id);

        if let Err(err) = self.store.save_iteration(&p).await {
            debug!(job = %p.job_id, error = %err, "store write skipped");
        }

        if passed {
            self.emit_log(
                &p.job_id,
                LogLevel::Success,
                "screen_passed",
                format!(
                    "✅ [{}] {} — {:.1}% in {} iterations",
                    p.platform, p.screen.name, p.diff.score, p.iteration
                ),
                None,
            )
            .await;

            // The notifier is a fire-and-forget sink.
            let notify = NotifyRequested {
                job_id: p.job_id.clone(),
                screen_name: p.screen.name.clone(),
                platform: p.platform,
                score: p.diff.score,
                iterations: p.iteration,
                diff_image_url: p.diff.diff_image_url.clone().unwrap_or_default(),
            };
            if let Err(err) = self.publish(events::NOTIFY_REQUESTED, &notify).await {
                debug!(job = %p.job_id, error = %err, "notify publish skipped");
            }

            return self
                .advance_or_complete(&p.job_id, p.screen_index, p.platform, p.diff.score, p.iteration)
                .await;
        }

        if p.iteration >= self.cfg.max_iterations {
            self.emit_log(
                &p.job_id,
                LogLevel::Warn,
                "max_iter",
                format!(
                    "⚠ [{}] max iterations reached (best: {:.1}%) — moving on",
                    p.platform, best_score
                ),
                None,
            )
            .await;
            // Terminal score is the one just observed; best_score stays on
            // the unit for diagnostics.
            return self
                .advance_or_complete(&p.job_id, p.screen_index, p.platform, p.diff.score, p.iteration)
                .await;
        }

        // Refine: surface the mismatches, then feed the diff back to codegen.
        for region in &p.diff.regions {
            self.emit_log(
                &p.job_id,
                LogLevel::Info,
                "diff_region",
                format!(
                    "  ↳ {}: found {:?}, expected {:?}",
                    region.property, region.actual, region.expected
                ),
                None,
            )
            .await;
        }
        self.emit_log(
            &p.job_id,
            LogLevel::Info,
            "refining",
            format!(
                "[{}] {:.1}% < {}% — refining (iter {} → {})…",
                p.platform,
                p.diff.score,
                p.threshold,
                p.iteration,
                p.iteration + 1
            ),
            None,
        )
        .await;

        self.request_codegen(
            &p.job_id,
            p.screen_index,
            p.platform,
            p.screen.clone(),
            Some(p.diff.clone()),
            p.iteration + 1,
        )
        .await
    }

    pub(super) async fn on_diff_failed(&self, body: &[u8]) -> Result<(), HandlerError> {
        let p: DiffFailed = decode(body)?;
        self.emit_log(
            &p.job_id,
            LogLevel::Error,
            "diff_failed",
            format!("[{}] diff error: {}", p.platform, p.error),
            None,
        )
        .await;
        self.advance_or_complete(&p.job_id, p.screen_index, p.platform, 0.0, 0)
            .await
    }

    /// Mirror every `log.*` message to connected live-feed clients. The
    /// stream is advisory, so undecodable envelopes are dropped quietly.
    pub(super) async fn on_log_relay(&self, body: &[u8]) -> Result<(), HandlerError> {
        if let Ok(envelope) = events::unwrap_envelope(body) {
            self.hub.broadcast_envelope(&envelope);
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
