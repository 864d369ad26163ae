use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    HeadingArray,
    AnswerObject,
    Verdict,
    HeadingOutline,
}

impl fmt::Display for OutputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OutputShape::HeadingArray => "heading array",
            OutputShape::AnswerObject => "answer object",
            OutputShape::Verdict => "review verdict",
            OutputShape::HeadingOutline => "heading outline",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedOutput {
    #[error("{shape}: response is not valid JSON ({reason})")]
    NotJson { shape: OutputShape, reason: String },
    #[error("{shape}: expected {expected}")]
    WrongShape {
        shape: OutputShape,
        expected: &'static str,
    },
}

impl MalformedOutput {
    pub fn shape(&self) -> OutputShape {
        match self {
            MalformedOutput::NotJson { shape, .. } | MalformedOutput::WrongShape { shape, .. } => {
                *shape
            }
        }
    }
}

/// Why a stage fell back to its default value. Never escapes the workflow.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("oracle call failed: {0:#}")]
    Oracle(anyhow::Error),
    #[error("store query failed: {0:#}")]
    Store(anyhow::Error),
    #[error(transparent)]
    Malformed(#[from] MalformedOutput),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown provider {0}")]
    UnknownProvider(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}
