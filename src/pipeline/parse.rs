//! Parse stage: extracted text → [`BiographyRecord`] via a language model.
//!
//! This is the only stage with network I/O and the only one that costs money
//! per unit, which is why the runner's skip rule matters most here: a unit
//! with a current, structurally valid record never reaches [`ParseTransform`].
//!
//! ## Failure contract
//!
//! * Transient provider errors (rate limits, 5xx, network failures) are
//!   retried with exponential backoff (`retry_backoff_ms * 2^(attempt-1)`).
//!   Permanent ones (bad credentials, invalid request, unknown model, context
//!   too long) fail the unit on the first attempt.
//! * A unit whose generator call, retries included, exceeds the timeout
//!   fails; it is not retried.
//! * A response that is not valid JSON is repaired locally
//!   ([`super::repair`]); if that fails the unit fails with a
//!   [`ParseFailure`]. The generator is never called again for it.

use super::repair::repair_json;
use crate::config::PipelineConfig;
use crate::error::{ParseFailure, PipelineError, TransformError};
use crate::prompts::{biography_message, DEFAULT_SYSTEM_PROMPT};
use crate::record::BiographyRecord;
use crate::runner::Transform;
use crate::unit::UnitId;
use async_trait::async_trait;
use edgequake_llm::{
    ChatMessage, CompletionOptions, LLMProvider, LlmError, ProviderFactory, RetryStrategy,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Declared revision of the parse logic and prompt.
pub const CODE_VERSION: &str = "parse-v1";

/// The external text generator: prompt in, raw string out.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String, TransformError>;
}

/// [`Generator`] backed by an `edgequake-llm` provider.
pub struct LlmGenerator {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl LlmGenerator {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        temperature: f32,
        max_tokens: usize,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            provider,
            options: build_options(temperature, max_tokens),
            max_retries,
            retry_backoff_ms,
        }
    }
}

/// Build `CompletionOptions` for near-deterministic extraction.
fn build_options(temperature: f32, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, system: &str, user: &str) -> Result<String, TransformError> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let mut attempt = 0;

        loop {
            match self.provider.chat(&messages, Some(&self.options)).await {
                Ok(response) => {
                    debug!(
                        "Generator: {} input tokens, {} output tokens",
                        response.prompt_tokens, response.completion_tokens
                    );
                    return Ok(response.content);
                }
                Err(e) if is_transient(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                    warn!(
                        "Generator failed ({}), retry {}/{} after {}ms",
                        e, attempt, self.max_retries, backoff
                    );
                    sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    warn!("Generator failed after {} retries: {}", attempt, e);
                    return Err(TransformError::Generator {
                        retries: attempt,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Whether a provider error is worth another attempt.
fn is_transient(e: &LlmError) -> bool {
    matches!(
        e.retry_strategy(),
        RetryStrategy::ExponentialBackoff { .. } | RetryStrategy::WaitAndRetry { .. }
    )
}

// ── Provider resolution ──────────────────────────────────────────────────────

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) plus optional model; the
///    factory reads the matching API key from the environment.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. `OPENAI_API_KEY` present → OpenAI.
/// 5. **Full auto-detection** via [`ProviderFactory::from_env`].
///
/// Called by the driver before any stage runs, so a missing credential fails
/// the run up front instead of failing every unit of the parse stage.
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Parse a raw generator response: direct parse first, then repair.
pub fn parse_response(unit_id: &UnitId, raw: &str) -> Result<BiographyRecord, ParseFailure> {
    let failure = |reason: String| ParseFailure {
        unit_id: unit_id.to_string(),
        raw_response: raw.to_string(),
        reason,
    };

    let direct_err = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => return BiographyRecord::from_value(value).map_err(failure),
        Err(e) => e.to_string(),
    };

    let repaired = repair_json(raw)
        .ok_or_else(|| failure(format!("invalid JSON ({direct_err}); repair not possible")))?;
    let value: Value = serde_json::from_str(&repaired)
        .map_err(|e| failure(format!("invalid JSON after repair: {e}")))?;
    debug!("{}: response accepted after repair", unit_id);
    BiographyRecord::from_value(value).map_err(failure)
}

/// The parse stage transform: text payload in, pretty JSON record out.
pub struct ParseTransform {
    generator: Arc<dyn Generator>,
    system_prompt: String,
    timeout: Duration,
    rejected_dir: Option<PathBuf>,
}

impl ParseTransform {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self {
            generator,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout,
            rejected_dir: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Keep unparseable responses as `<dir>/<unit_id>.txt` for inspection.
    pub fn with_rejected_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.rejected_dir = Some(dir.into());
        self
    }

    /// Call the generator for one unit and parse its answer.
    pub async fn parse_unit(
        &self,
        unit_id: &UnitId,
        text: &str,
    ) -> Result<BiographyRecord, TransformError> {
        let start = Instant::now();
        let user = biography_message(text);

        let raw = match tokio::time::timeout(
            self.timeout,
            self.generator.generate(&self.system_prompt, &user),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransformError::Timeout {
                    secs: self.timeout.as_secs().max(1),
                })
            }
        };
        debug!(
            "{}: {} chars of response in {:?}",
            unit_id,
            raw.len(),
            start.elapsed()
        );

        match parse_response(unit_id, &raw) {
            Ok(record) => Ok(record),
            Err(failure) => {
                self.keep_rejected(unit_id, &failure.raw_response);
                Err(failure.into())
            }
        }
    }

    fn keep_rejected(&self, unit_id: &UnitId, raw: &str) {
        let Some(ref dir) = self.rejected_dir else {
            return;
        };
        let path = dir.join(format!("{unit_id}.txt"));
        let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, raw));
        if let Err(e) = result {
            warn!("Could not keep rejected response at {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl Transform for ParseTransform {
    async fn apply(&self, unit_id: &UnitId, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        let text = std::str::from_utf8(input).map_err(|e| TransformError::Encoding {
            detail: e.to_string(),
        })?;
        let record = self.parse_unit(unit_id, text).await?;
        serde_json::to_vec_pretty(&record).map_err(|e| TransformError::Store {
            detail: e.to_string(),
        })
    }
}
