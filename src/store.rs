//! Best-effort persistence into Supabase's REST surface.
//!
//! Every write is short-lived and optional: failures are logged by the
//! caller and never propagate into the pipeline. With no `SUPABASE_URL`
//! configured the store is a no-op.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::events::{DiffComplete, JobSubmitted};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Store {
    base_url: String,
    key: String,
    client: reqwest::Client,
}

impl Store {
    pub fn new(base_url: &str, key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn disabled(&self) -> bool {
        self.base_url.is_empty()
    }

    pub async fn create_job(&self, p: &JobSubmitted) -> Result<()> {
        if self.disabled() {
            return Ok(());
        }
        self.post(
            "jobs",
            serde_json::json!({
                "id": p.job_id,
                "design_url": p.design_url,
                "repo_url": p.repo_url,
                "platforms": p.platforms,
                "styling": p.styling,
                "threshold": p.threshold,
                "status": "pending",
            }),
        )
        .await
    }

    pub async fn update_screen_count(&self, job_id: &str, count: usize) -> Result<()> {
        if self.disabled() {
            return Ok(());
        }
        self.patch(
            &format!("jobs?id=eq.{}", job_id),
            serde_json::json!({
                "screen_count": count,
                "status": "running",
                "updated_at": Utc::now(),
            }),
        )
        .await
    }

    pub async fn mark_job_done(&self, job_id: &str) -> Result<()> {
        if self.disabled() {
            return Ok(());
        }
        self.patch(
            &format!("jobs?id=eq.{}", job_id),
            serde_json::json!({"status": "done", "updated_at": Utc::now()}),
        )
        .await
    }

    pub async fn mark_job_failed(&self, job_id: &str, error: &str) -> Result<()> {
        if self.disabled() {
            return Ok(());
        }
        self.patch(
            &format!("jobs?id=eq.{}", job_id),
            serde_json::json!({"status": "failed", "error": error, "updated_at": Utc::now()}),
        )
        .await
    }

    pub async fn save_iteration(&self, p: &DiffComplete) -> Result<()> {
        if self.disabled() {
            return Ok(());
        }
        self.post(
            "iterations",
            serde_json::json!({
                "job_id": p.job_id,
                "screen_name": p.screen.name,
                "platform": p.platform,
                "iteration": p.iteration,
                "score": p.diff.score,
                "layout_score": p.diff.layout,
                "typo_score": p.diff.typography,
                "spacing_score": p.diff.spacing,
                "color_score": p.diff.color,
                "diff_url": p.diff.diff_image_url,
                "mismatch_regions": p.diff.regions,
            }),
        )
        .await
    }

    async fn post(&self, table: &str, body: serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/rest/v1/{}", self.base_url, table))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.key)
            .header("apikey", &self.key)
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("store insert into {}", table))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            bail!("store insert into {} returned {}: {}", table, status, detail);
        }
        Ok(())
    }

    async fn patch(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .patch(format!("{}/rest/v1/{}", self.base_url, path))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.key)
            .header("apikey", &self.key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("store update {}", path))?;
        if !resp.status().is_success() {
            bail!("store update {} returned {}", path, resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{testing, Platform};

    #[tokio::test]
    async fn disabled_store_is_a_no_op() {
        let store = Store::new("", "");
        let submission = JobSubmitted {
            job_id: "job-1".into(),
            design_url: "https://figma.example/file/abc".into(),
            repo_url: None,
            platforms: vec![Platform::React],
            styling: "tailwind".into(),
            threshold: 95,
        };
        store.create_job(&submission).await.unwrap();
        store.update_screen_count("job-1", 3).await.unwrap();
        store.mark_job_done("job-1").await.unwrap();
        store.mark_job_failed("job-1", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_store_skips_iterations_too() {
        let store = Store::new("", "service-key");
        let payload = DiffComplete {
            job_id: "job-1".into(),
            screen_index: 0,
            platform: Platform::Kmp,
            iteration: 1,
            container_id: "c-1".into(),
            diff: testing::diff(77.0),
            threshold: 95,
            passed: false,
            screen: testing::screen("Home"),
        };
        store.save_iteration(&payload).await.unwrap();
    }

    #[test]
    fn base_url_is_normalized() {
        let store = Store::new("https://db.example.com/", "k");
        assert_eq!(store.base_url, "https://db.example.com");
        assert!(!store.disabled());
    }
}
