//! The message contract published on the `forge.events` topic exchange.
//!
//! Every service speaks only this contract; there are no direct
//! service-to-service calls. Each routing key maps to exactly one payload
//! struct; payloads travel wrapped in an [`Envelope`].

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

// ── Routing keys ──────────────────────────────────────────────────────

pub const JOB_SUBMITTED: &str = "job.submitted";
pub const FIGMA_PARSE_REQUESTED: &str = "figma.parse.requested";
pub const FIGMA_PARSED: &str = "figma.parsed";
pub const FIGMA_FAILED: &str = "figma.failed";
pub const CODEGEN_REQUESTED: &str = "codegen.requested";
pub const CODEGEN_COMPLETE: &str = "codegen.complete";
pub const CODEGEN_FAILED: &str = "codegen.failed";
pub const SANDBOX_BUILD_REQUESTED: &str = "sandbox.build.requested";
pub const SANDBOX_READY: &str = "sandbox.ready";
pub const SANDBOX_FAILED: &str = "sandbox.failed";
pub const DIFF_REQUESTED: &str = "diff.requested";
pub const DIFF_COMPLETE: &str = "diff.complete";
pub const DIFF_FAILED: &str = "diff.failed";
pub const NOTIFY_REQUESTED: &str = "notify.requested";
pub const LOG_EVENT: &str = "log.event";
pub const SCREEN_DONE: &str = "screen.done";
pub const JOB_DONE: &str = "job.done";
pub const JOB_FAILED: &str = "job.failed";

// ── Platforms ─────────────────────────────────────────────────────────

/// Target platforms a screen can be generated for. Closed vocabulary;
/// unknown names fail to deserialize at the ingress boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    React,
    Nextjs,
    Kmp,
    Flutter,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::React => "react",
            Self::Nextjs => "nextjs",
            Self::Kmp => "kmp",
            Self::Flutter => "flutter",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "react" => Ok(Self::React),
            "nextjs" => Ok(Self::Nextjs),
            "kmp" => Ok(Self::Kmp),
            "flutter" => Ok(Self::Flutter),
            _ => Err(format!("Invalid platform: {}", s)),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platforms used when a submission names none.
pub const DEFAULT_PLATFORMS: [Platform; 2] = [Platform::React, Platform::Kmp];

// ── Envelope ──────────────────────────────────────────────────────────

/// Universal container for every bus message.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub routing_key: String,
    pub ts: DateTime<Utc>,
    pub payload: Box<RawValue>,
}

/// JSON-encode `payload`, then wrap it in an envelope with a fresh id and
/// the current timestamp.
pub fn wrap<T: Serialize>(routing_key: &str, payload: &T) -> Result<Vec<u8>, serde_json::Error> {
    let raw = serde_json::value::to_raw_value(payload)?;
    serde_json::to_vec(&Envelope {
        id: Uuid::new_v4(),
        routing_key: routing_key.to_string(),
        ts: Utc::now(),
        payload: raw,
    })
}

/// Decode the envelope, then decode its payload as `T`.
pub fn unwrap<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T, serde_json::Error> {
    let env: Envelope = serde_json::from_slice(raw)?;
    serde_json::from_str(env.payload.get())
}

/// Decode only the envelope, leaving the payload opaque. Used by relays
/// that forward without knowing the payload type.
pub fn unwrap_envelope(raw: &[u8]) -> Result<Envelope, serde_json::Error> {
    serde_json::from_slice(raw)
}

// ── Payload types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSubmitted {
    pub job_id: String,
    pub design_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    pub platforms: Vec<Platform>,
    pub styling: String,
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FigmaParseRequested {
    pub job_id: String,
    pub design_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextStyle {
    pub font_family: String,
    pub font_size: f64,
    pub font_weight: u32,
    pub line_height: f64,
    pub letter_spacing: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentNode {
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub props: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ComponentNode>,
}

/// One screen extracted from the design file. Immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Screen {
    pub node_id: String,
    pub name: String,
    pub width: f64,
    pub height: f64,
    pub colors: HashMap<String, String>,
    pub typography: HashMap<String, TextStyle>,
    pub spacing: Vec<f64>,
    pub border_radii: Vec<f64>,
    pub component_tree: ComponentNode,
    pub reference_image_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FigmaParsed {
    pub job_id: String,
    pub file_name: String,
    pub screens: Vec<Screen>,
    pub screen_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FigmaFailed {
    pub job_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MismatchRegion {
    pub property: String,
    pub actual: String,
    pub expected: String,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Weighted visual-similarity verdict. The composite `score` decides
/// pass/fail; the per-axis scores are diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffResult {
    pub score: f64,
    pub layout: f64,
    pub typography: f64,
    pub spacing: f64,
    pub color: f64,
    #[serde(default)]
    pub regions: Vec<MismatchRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodegenRequested {
    pub job_id: String,
    pub screen_index: usize,
    pub screen: Screen,
    pub platform: Platform,
    pub styling: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_diff: Option<DiffResult>,
    pub iteration: u32,
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodegenComplete {
    pub job_id: String,
    pub screen_index: usize,
    pub platform: Platform,
    pub iteration: u32,
    pub code: String,
    pub filename: String,
    pub threshold: u32,
    pub screen: Screen,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodegenFailed {
    pub job_id: String,
    pub screen_index: usize,
    pub platform: Platform,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxBuildRequested {
    pub job_id: String,
    pub screen_index: usize,
    pub platform: Platform,
    pub iteration: u32,
    pub code: String,
    pub filename: String,
    pub threshold: u32,
    pub screen: Screen,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxReady {
    pub job_id: String,
    pub screen_index: usize,
    pub platform: Platform,
    pub iteration: u32,
    pub container_id: String,
    pub port: u16,
    pub url: String,
    pub threshold: u32,
    pub screen: Screen,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxFailed {
    pub job_id: String,
    pub screen_index: usize,
    pub platform: Platform,
    pub error: String,
    #[serde(default)]
    pub build_log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffRequested {
    pub job_id: String,
    pub screen_index: usize,
    pub platform: Platform,
    pub iteration: u32,
    pub sandbox_url: String,
    pub container_id: String,
    pub figma_export_url: String,
    pub screen: Screen,
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffComplete {
    pub job_id: String,
    pub screen_index: usize,
    pub platform: Platform,
    pub iteration: u32,
    pub container_id: String,
    pub diff: DiffResult,
    pub threshold: u32,
    pub passed: bool,
    pub screen: Screen,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffFailed {
    pub job_id: String,
    pub screen_index: usize,
    pub platform: Platform,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyRequested {
    pub job_id: String,
    pub screen_name: String,
    pub platform: Platform,
    pub score: f64,
    pub iterations: u32,
    #[serde(default)]
    pub diff_image_url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    pub job_id: String,
    pub level: LogLevel,
    pub step: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenDone {
    pub job_id: String,
    pub screen_index: usize,
    pub screen_name: String,
    pub platform: Platform,
    pub score: f64,
    pub iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDone {
    pub job_id: String,
    pub screens: usize,
    pub platforms: Vec<Platform>,
    pub avg_score: f64,
    pub total_iter: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFailed {
    pub job_id: String,
    pub error: String,
    pub step: String,
}

// ── Test fixtures ─────────────────────────────────────────────────────
