use std::collections::HashSet;
use std::env;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const MAX_BACKOFF_SECS: u64 = 30;

/// Anything that can turn a (system, user) prompt pair into raw completion text.
///
/// The workflow only ever talks to this trait, so tests substitute scripted closures
/// and the binaries hand in an [`LlmClient`].
pub trait Oracle {
    fn complete(&self, system: &str, user: &str) -> Result<String>;
}

impl<F> Oracle for F
where
    F: Fn(&str, &str) -> Result<String>,
{
    fn complete(&self, system: &str, user: &str) -> Result<String> {
        self(system, user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAi),
            "anthropic" => Some(LlmProvider::Anthropic),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::Anthropic => "claude-3-5-sonnet",
            LlmProvider::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Transport settings applied to every provider call.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub max_retries: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    options: ClientOptions,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    OpenAi(OpenAiConfig),
    Anthropic(AnthropicConfig),
    Local,
}

#[derive(Clone)]
struct OpenAiConfig {
    api_key: String,
    base_url: String,
}

#[derive(Clone)]
struct AnthropicConfig {
    api_key: String,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        Self::with_options(provider, model, ClientOptions::default())
    }

    pub fn with_options(
        provider: LlmProvider,
        model: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self> {
        let config = match provider {
            LlmProvider::OpenAi => ProviderConfig::OpenAi(OpenAiConfig {
                api_key: read_api_key("OPENAI_API_KEY")?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            }),
            LlmProvider::Anthropic => ProviderConfig::Anthropic(AnthropicConfig {
                api_key: read_api_key("ANTHROPIC_API_KEY")?,
                max_tokens: env::var("ANTHROPIC_MAX_TOKENS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1024),
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        let http = Client::builder()
            .timeout(options.timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            provider,
            model: model.into(),
            options,
            config,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match &self.config {
            ProviderConfig::OpenAi(cfg) => self.chat_openai(cfg, req),
            ProviderConfig::Anthropic(cfg) => self.chat_anthropic(cfg, req),
            ProviderConfig::Local => Ok(self.chat_local(req)),
        }
    }

    fn chat_openai(&self, cfg: &OpenAiConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({"role": "system", "content": system }));
        }
        messages.push(json!({"role": "user", "content": req.user }));
        let payload = json!({
            "model": self.model,
            "messages": messages,
        });
        let value = self.send_with_retry("openai", || {
            self.http
                .post(&url)
                .bearer_auth(&cfg.api_key)
                .json(&payload)
                .send()
        })?;
        let content = extract_openai_text(&value)
            .ok_or_else(|| anyhow!("missing text in OpenAI response"))?;
        let usage: OpenAiUsage = value
            .get("usage")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();
        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }

    fn chat_anthropic(&self, cfg: &AnthropicConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": cfg.max_tokens,
            "messages": [ { "role": "user", "content": req.user } ],
        });
        if let Some(system) = &req.system {
            payload["system"] = json!(system);
        }
        let value = self.send_with_retry("anthropic", || {
            self.http
                .post("https://api.anthropic.com/v1/messages")
                .header("x-api-key", &cfg.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&payload)
                .send()
        })?;
        let response: AnthropicResponse =
            serde_json::from_value(value).context("failed to decode anthropic response")?;
        let text = response
            .content
            .into_iter()
            .find_map(|part| part.text)
            .ok_or_else(|| anyhow!("missing text in Anthropic response"))?;
        let usage = response.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: text,
            prompt_tokens: usage.input_tokens.unwrap_or(0),
            completion_tokens: usage.output_tokens.unwrap_or(0),
        })
    }

    fn chat_local(&self, req: &LlmRequest) -> LlmResponse {
        LlmResponse {
            content: synthesize_local_response(req),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    /// Retries transport failures, 429 and 5xx with exponential backoff; anything else is
    /// returned immediately.
    fn send_with_retry<F>(&self, label: &str, send: F) -> Result<Value>
    where
        F: Fn() -> reqwest::Result<Response>,
    {
        let max_retries = self.options.max_retries;
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match send() {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt > max_retries {
                        return Err(err).with_context(|| format!("{label} request failed"));
                    }
                    warn!(provider = label, attempt, error = %err, "llm request failed, retrying");
                    sleep(backoff_delay(attempt, None));
                    continue;
                }
            };
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt > max_retries {
                    return Err(anyhow!(
                        "{label} returned {status} after {max_retries} retries"
                    ));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                warn!(provider = label, attempt, %status, ?wait, "llm provider throttled, backing off");
                sleep(wait);
                continue;
            }
            debug!(provider = label, attempt, %status, "llm response received");
            return decode_body(label, response);
        }
    }
}

impl Oracle for LlmClient {
    fn complete(&self, system: &str, user: &str) -> Result<String> {
        let response = self.chat(&LlmRequest {
            system: Some(system.to_string()),
            user: user.to_string(),
        })?;
        debug!(
            provider = self.provider.as_str(),
            model = %self.model,
            tokens = response.total_tokens(),
            "oracle completion"
        );
        Ok(response.content)
    }
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    let ceiling = Duration::from_secs(MAX_BACKOFF_SECS);
    let requested = retry_after
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<u64>().ok());
    if let Some(secs) = requested {
        return Duration::from_secs(secs.max(1)).min(ceiling);
    }
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500u64 << capped).min(ceiling)
}

fn decode_body(label: &str, response: Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("{label} returned error (status {status}): {body}"));
    }
    serde_json::from_str(&body).with_context(|| format!("failed to decode {label} response"))
}

/// Offline responder used by the `local` provider. It recognises the workflow's prompt
/// shapes well enough to drive an end-to-end run without network access.
fn synthesize_local_response(req: &LlmRequest) -> String {
    let system = req.system.as_deref().unwrap_or_default().to_lowercase();
    let user = req.user.as_str();
    if let Some(toc) = block_after(user, "Table of Contents:") {
        let headings: Vec<&str> = toc
            .lines()
            .filter_map(|line| line.trim().strip_prefix("- "))
            .map(str::trim)
            .collect();
        return json!(headings).to_string();
    }
    if user.to_lowercase().contains("respond with only 'yes' or 'no'") {
        return local_sufficiency(user).to_string();
    }
    if system.contains("quality assurance") {
        return json!({"status": "pass", "feedback": null}).to_string();
    }
    if system.contains("\"answer\"") && system.contains("\"citations\"") {
        let context = block_after(user, "Context:").unwrap_or_default();
        return local_draft(context);
    }
    if user.to_lowercase().contains("identify all headings") {
        let document = block_after(user, "Document:").unwrap_or_default();
        return local_outline(document);
    }
    summarize_text(user, 40)
}

const STOPWORDS: &[&str] = &[
    "about", "does", "from", "have", "should", "that", "there", "their", "this", "what",
    "when", "which", "with", "section", "content",
];

/// "yes" only when some meaningful query term appears in the retrieved context.
fn local_sufficiency(user: &str) -> &'static str {
    let query = user
        .split_once("Query:")
        .and_then(|(_, rest)| rest.split("Context:").next())
        .unwrap_or_default();
    let context = block_after(user, "Context:").unwrap_or_default();
    let context = context
        .rsplit_once("\n\n")
        .map(|(body, _question)| body)
        .unwrap_or(context);
    let available: HashSet<String> = terms(context).collect();
    if terms(query).any(|term| available.contains(&term)) {
        "yes"
    } else {
        "no"
    }
}

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 3)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
}

fn local_draft(context: &str) -> String {
    let mut citations: Vec<String> = Vec::new();
    let mut sentences = Vec::new();
    for block in context.split("\n\n") {
        let Some(rest) = block.trim().strip_prefix("[Source: ") else {
            continue;
        };
        let Some((heading, content)) = rest.split_once(']') else {
            continue;
        };
        let heading = heading.trim().to_string();
        sentences.push(format!(
            "{} [Source: {}]",
            summarize_text(content, 30),
            heading
        ));
        if !citations.contains(&heading) {
            citations.push(heading);
        }
    }
    json!({"answer": sentences.join(" "), "citations": citations}).to_string()
}

/// Short capitalised lines without terminal punctuation are treated as level-1 headings.
fn local_outline(document: &str) -> String {
    let headings: Vec<Value> = document
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && line.split_whitespace().count() <= 8
                && line.chars().next().is_some_and(char::is_uppercase)
                && !line.ends_with(['.', ',', ';', ':', '?', '!'])
        })
        .map(|line| json!({"heading_text": line, "level": 1}))
        .collect();
    Value::Array(headings).to_string()
}

fn block_after<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.find(marker)
        .map(|idx| text[idx + marker.len()..].trim())
}

fn summarize_text(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

fn read_api_key(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!("{var} is not set"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("{var} is empty"));
    }
    Ok(value)
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(|t| t.as_str()))
        .map(str::to_string)
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LlmClient {
        LlmClient::new(LlmProvider::Local, "local").unwrap()
    }

    #[test]
    fn provider_names_roundtrip() {
        for provider in [LlmProvider::OpenAi, LlmProvider::Anthropic, LlmProvider::Local] {
            assert_eq!(LlmProvider::from_str(provider.as_str()), Some(provider));
        }
        assert_eq!(LlmProvider::from_str(" OpenAI "), Some(LlmProvider::OpenAi));
        assert_eq!(LlmProvider::from_str("gemini"), None);
    }

    #[test]
    fn closures_act_as_oracles() {
        let oracle = |system: &str, user: &str| -> Result<String> {
            Ok(format!("{}|{}", system.len(), user))
        };
        assert_eq!(oracle.complete("abc", "hi").unwrap(), "3|hi");
    }

    #[test]
    fn local_provider_selects_every_toc_heading() {
        let out = local()
            .complete(
                "pick headings",
                "Query: q\n\nTable of Contents:\n- Diagnosis\n- Treatment\n\nReturn JSON array of relevant headings:",
            )
            .unwrap();
        let parsed: Vec<String> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, vec!["Diagnosis", "Treatment"]);
    }

    #[test]
    fn local_provider_drafts_cited_answer() {
        let out = local()
            .complete(
                "Format your response as a JSON object with keys: \"answer\" and \"citations\"",
                "Query: q\n\nContext:\n[Source: Treatment] Metformin is first line.",
            )
            .unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["citations"][0], "Treatment");
        assert!(value["answer"]
            .as_str()
            .unwrap()
            .contains("[Source: Treatment]"));
    }

    #[test]
    fn local_provider_validates_and_passes_audit() {
        let client = local();
        let verdict = client
            .complete("You are a Quality Assurance auditor", "Answer to Audit:\nx")
            .unwrap();
        assert!(verdict.contains("\"pass\""));
        let ask = |query: &str, context: &str| {
            client
                .complete(
                    "validator",
                    &format!("Query: {query}\n\nContext:\n{context}\n\nDoes the context contain the answer? Respond with only 'yes' or 'no'."),
                )
                .unwrap()
        };
        let context = "Section: Treatment\nContent: Offer metformin as first-line treatment.";
        assert_eq!(ask("first-line treatment for Type 2 diabetes", context), "yes");
    }

    #[test]
    fn local_validator_rejects_unrelated_context() {
        let client = local();
        let decision = client
            .complete(
                "validator",
                "Query: paediatric insulin pump settings for ketoacidosis\n\nContext:\nSection: Diagnosis\nContent: Measure HbA1c.\n\nDoes the context contain the answer? Respond with only 'yes' or 'no'.",
            )
            .unwrap();
        assert_eq!(decision, "no");
        let empty = client
            .complete(
                "validator",
                "Does the context contain the answer? Respond with only 'yes' or 'no'.",
            )
            .unwrap();
        assert_eq!(empty, "no");
    }

    #[test]
    fn local_provider_outlines_plain_text() {
        let out = local()
            .complete(
                "You map the structure of clinical guideline documents.",
                "Analyze this clinical document and identify all headings and their hierarchy.\n\nDocument:\nDiagnosis\nMeasure HbA1c.\n\nTreatment\nOffer metformin.",
            )
            .unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        let headings: Vec<&str> = value
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["heading_text"].as_str().unwrap())
            .collect();
        assert_eq!(headings, vec!["Diagnosis", "Treatment"]);
    }

    #[test]
    fn backoff_honours_retry_after() {
        let header = HeaderValue::from_static("7");
        assert_eq!(backoff_delay(1, Some(&header)), Duration::from_secs(7));
        assert!(backoff_delay(3, None) > backoff_delay(1, None));
    }

    #[test]
    fn backoff_never_exceeds_ceiling() {
        let ceiling = Duration::from_secs(MAX_BACKOFF_SECS);
        let day = HeaderValue::from_static("86400");
        assert_eq!(backoff_delay(1, Some(&day)), ceiling);
        assert!(backoff_delay(usize::MAX, None) <= ceiling);
        let garbage = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(backoff_delay(1, Some(&garbage)), backoff_delay(1, None));
    }

    #[test]
    fn extracts_chat_completion_text() {
        let value = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_openai_text(&value).as_deref(), Some("hello"));
        assert_eq!(extract_openai_text(&json!({})), None);
    }
}
