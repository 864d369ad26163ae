use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use guideline_llm::{ClientOptions, LlmClient, LlmProvider};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG: &str = "guideline.toml";
pub const DEFAULT_DB: &str = "guidelines.sqlite";
pub const DEFAULT_MAX_REVIEW_RETRIES: u32 = 2;
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LLM_MAX_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_review_retries: u32,
    /// Fall back to the first stored document when a query names none.
    pub allow_default_document: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_review_retries: DEFAULT_MAX_REVIEW_RETRIES,
            allow_default_document: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmSection {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// Runtime settings. Environment variables win over the config file, which wins over
/// built-in defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub provider: LlmProvider,
    pub model: String,
    pub db_path: PathBuf,
    pub env: String,
    pub llm_timeout: Duration,
    pub llm_max_retries: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(|key| env::var(key).ok(), &FileConfig::default())
    }

    pub fn resolve<F>(lookup: F, file: &FileConfig) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let provider_name = var("GUIDELINE_PROVIDER")
            .or_else(|| file.llm.provider.clone())
            .unwrap_or_else(|| "openai".to_string());
        let provider = LlmProvider::from_str(&provider_name)
            .ok_or_else(|| ConfigError::UnknownProvider(provider_name.clone()))?;
        let model = var("GUIDELINE_MODEL")
            .or_else(|| file.llm.model.clone())
            .unwrap_or_else(|| provider.default_model().to_string());
        let db_path = var("GUIDELINE_DB")
            .map(PathBuf::from)
            .or_else(|| file.store.path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
        let timeout_secs = match var("GUIDELINE_LLM_TIMEOUT_SECS") {
            Some(raw) => parse_number("GUIDELINE_LLM_TIMEOUT_SECS", &raw)?,
            None => file.llm.timeout_secs.unwrap_or(DEFAULT_LLM_TIMEOUT_SECS),
        };
        let llm_max_retries = match var("GUIDELINE_LLM_MAX_RETRIES") {
            Some(raw) => parse_number("GUIDELINE_LLM_MAX_RETRIES", &raw)?,
            None => file.llm.max_retries.unwrap_or(DEFAULT_LLM_MAX_RETRIES),
        };
        Ok(Self {
            openai_api_key: var("OPENAI_API_KEY"),
            anthropic_api_key: var("ANTHROPIC_API_KEY"),
            provider,
            model,
            db_path,
            env: var("ENV").unwrap_or_else(|| "local".to_string()),
            llm_timeout: Duration::from_secs(timeout_secs),
            llm_max_retries,
        })
    }

    pub fn has_api_key(&self) -> bool {
        match self.provider {
            LlmProvider::OpenAi => self.openai_api_key.is_some(),
            LlmProvider::Anthropic => self.anthropic_api_key.is_some(),
            LlmProvider::Local => true,
        }
    }

    pub fn has_store(&self) -> bool {
        !self.db_path.as_os_str().is_empty()
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            timeout: self.llm_timeout,
            max_retries: self.llm_max_retries,
        }
    }

    /// Never substitutes the offline responder: `local` must be selected explicitly.
    pub fn build_oracle(&self) -> anyhow::Result<LlmClient> {
        if !self.has_api_key() {
            anyhow::bail!("no api key configured for provider {}", self.provider.as_str());
        }
        LlmClient::with_options(self.provider, self.model.clone(), self.client_options())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings: Settings,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    /// Loads `path`, else `$GUIDELINE_CONFIG`, else `guideline.toml`; a missing file means
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("GUIDELINE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
        let file = load_file_config(&path)?;
        let settings = Settings::resolve(|key| env::var(key).ok(), &file)?;
        Ok(Self {
            settings,
            workflow: file.workflow,
        })
    }
}

pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}
