//! Configuration types for a pipeline run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. One struct holds every knob so a run can be
//! logged in full and two runs can be diffed to understand why one of them
//! reprocessed units the other skipped.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use crate::runner::CancelFlag;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Split,
    Extract,
    Parse,
    Join,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::Split,
        StageName::Extract,
        StageName::Parse,
        StageName::Join,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Split => "split",
            StageName::Extract => "extract",
            StageName::Parse => "parse",
            StageName::Join => "join",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "split" => Ok(StageName::Split),
            "extract" => Ok(StageName::Extract),
            "parse" => Ok(StageName::Parse),
            "join" => Ok(StageName::Join),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown stage '{other}' (expected split, extract, parse or join)"
            ))),
        }
    }
}

/// Configuration for a pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use bio2csv::{PipelineConfig, StageName};
///
/// let config = PipelineConfig::builder()
///     .work_dir("work")
///     .source_pdf("biographies.pdf")
///     .page_offset(12)
///     .code_version(StageName::Parse, "parse-v2")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of all per-unit stores and final tables. Default: `./work`.
    pub work_dir: PathBuf,

    /// The biographical source document. Only required by the split stage.
    pub source_pdf: Option<PathBuf>,

    /// Bookmarks pointing at pages before this 0-based index are front
    /// matter, not subjects. Default: 0.
    pub page_offset: usize,

    /// Stages to run, in order. Default: all four.
    pub stages: Vec<StageName>,

    /// Operator overrides of each stage's declared code version.
    ///
    /// Raising a stage's version is how an operator forces every unit of that
    /// stage to be reprocessed; the engine never infers that logic changed.
    pub code_versions: BTreeMap<StageName, String>,

    /// Also compare the stored input fingerprint before skipping. Default: false.
    ///
    /// Off by default: inputs are append-only per unit, so existence plus a
    /// version match is enough, and skipping the hash keeps reruns cheap.
    pub verify_fingerprints: bool,

    /// Worker pool size for split and extract. Default: 4.
    pub concurrency: usize,

    /// Concurrent generator calls in the parse stage. Default: 4.
    ///
    /// Kept separate from `concurrency` because the generator is a paid,
    /// rate-limited remote service.
    pub llm_concurrency: usize,

    /// LLM model identifier. If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per unit. Default: 4096.
    pub max_tokens: usize,

    /// Retries on transient generator failures (rate limits, 5xx, network
    /// errors). Default: 2.
    ///
    /// Permanent provider errors and structurally invalid responses are
    /// never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-generator-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Custom extraction prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Optional progress callback for stage and unit events.
    pub progress_callback: Option<ProgressCallback>,

    /// Shared flag checked before each unit starts.
    pub cancel: CancelFlag,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            source_pdf: None,
            page_offset: 0,
            stages: StageName::ALL.to_vec(),
            code_versions: BTreeMap::new(),
            verify_fingerprints: false,
            concurrency: 4,
            llm_concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            system_prompt: None,
            progress_callback: None,
            cancel: CancelFlag::default(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("work_dir", &self.work_dir)
            .field("source_pdf", &self.source_pdf)
            .field("page_offset", &self.page_offset)
            .field("stages", &self.stages)
            .field("code_versions", &self.code_versions)
            .field("verify_fingerprints", &self.verify_fingerprints)
            .field("concurrency", &self.concurrency)
            .field("llm_concurrency", &self.llm_concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn runs(&self, stage: StageName) -> bool {
        self.stages.contains(&stage)
    }

    /// The code version in effect for `stage`: the operator override if any,
    /// else the stage's declared default.
    pub fn code_version(&self, stage: StageName, declared: &str) -> String {
        self.code_versions
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| declared.to_string())
    }

    pub fn split_dir(&self) -> PathBuf {
        self.work_dir.join("split")
    }

    pub fn text_dir(&self) -> PathBuf {
        self.work_dir.join("text")
    }

    pub fn parsed_dir(&self) -> PathBuf {
        self.work_dir.join("parsed")
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.work_dir.join("tables")
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.work_dir.join("rejected")
    }

    pub fn export_dir(&self) -> PathBuf {
        self.work_dir.join("export")
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn source_pdf(mut self, path: impl AsRef<Path>) -> Self {
        self.config.source_pdf = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn page_offset(mut self, offset: usize) -> Self {
        self.config.page_offset = offset;
        self
    }

    pub fn stages(mut self, stages: impl IntoIterator<Item = StageName>) -> Self {
        let mut stages: Vec<StageName> = stages.into_iter().collect();
        stages.sort_unstable();
        stages.dedup();
        self.config.stages = stages;
        self
    }

    pub fn code_version(mut self, stage: StageName, version: impl Into<String>) -> Self {
        self.config.code_versions.insert(stage, version.into());
        self
    }

    pub fn verify_fingerprints(mut self, v: bool) -> Self {
        self.config.verify_fingerprints = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn llm_concurrency(mut self, n: usize) -> Self {
        self.config.llm_concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.config.cancel = flag;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one stage must be selected".into(),
            ));
        }
        if c.runs(StageName::Split) && c.source_pdf.is_none() {
            return Err(PipelineError::InvalidConfig(
                "the split stage needs a source PDF".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if let Some((stage, _)) = c.code_versions.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(PipelineError::InvalidConfig(format!(
                "code version for stage '{stage}' must not be empty"
            )));
        }
        Ok(self.config)
    }
}

/// Parse a `stage=version` override, as accepted by the CLI.
pub fn parse_code_version(s: &str) -> Result<(StageName, String), PipelineError> {
    let (stage, version) = s.split_once('=').ok_or_else(|| {
        PipelineError::InvalidConfig(format!("expected STAGE=VERSION, got '{s}'"))
    })?;
    let version = version.trim();
    if version.is_empty() {
        return Err(PipelineError::InvalidConfig(format!(
            "empty version in '{s}'"
        )));
    }
    Ok((stage.parse()?, version.to_string()))
}
