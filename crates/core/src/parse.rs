//! Strict readers for the JSON replies the oracle is asked to produce.
//!
//! Every reader first strips markdown code fences, then validates the expected shape
//! and reports a [`MalformedOutput`] instead of guessing.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{MalformedOutput, OutputShape};
use crate::state::FinalResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DetectedHeading {
    pub heading_text: String,
    pub level: u8,
    #[serde(default)]
    pub start_position: Option<usize>,
}

pub fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

fn parse_json(raw: &str, shape: OutputShape) -> Result<Value, MalformedOutput> {
    serde_json::from_str(&strip_code_fences(raw)).map_err(|err| MalformedOutput::NotJson {
        shape,
        reason: err.to_string(),
    })
}

fn string_array(value: &Value, shape: OutputShape) -> Result<Vec<String>, MalformedOutput> {
    let wrong = MalformedOutput::WrongShape {
        shape,
        expected: "an array of strings",
    };
    let items = value.as_array().ok_or_else(|| wrong.clone())?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(|| wrong.clone()))
        .collect()
}

pub fn parse_heading_array(raw: &str) -> Result<Vec<String>, MalformedOutput> {
    let value = parse_json(raw, OutputShape::HeadingArray)?;
    string_array(&value, OutputShape::HeadingArray)
}

pub fn parse_answer_object(raw: &str) -> Result<FinalResponse, MalformedOutput> {
    let shape = OutputShape::AnswerObject;
    let value = parse_json(raw, shape)?;
    let object = value.as_object().ok_or(MalformedOutput::WrongShape {
        shape,
        expected: "a JSON object",
    })?;
    let answer = object
        .get("answer")
        .and_then(Value::as_str)
        .ok_or(MalformedOutput::WrongShape {
            shape,
            expected: "a string `answer` field",
        })?;
    let citations = match object.get("citations") {
        None | Some(Value::Null) => Vec::new(),
        Some(list) => string_array(list, shape)?,
    };
    Ok(FinalResponse {
        answer: answer.to_string(),
        citations,
    })
}

pub fn parse_verdict(raw: &str) -> Result<Verdict, MalformedOutput> {
    let shape = OutputShape::Verdict;
    let value = parse_json(raw, shape)?;
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase());
    let status = match status.as_deref() {
        Some("pass") => VerdictStatus::Pass,
        Some("fail") => VerdictStatus::Fail,
        _ => {
            return Err(MalformedOutput::WrongShape {
                shape,
                expected: "`status` of \"pass\" or \"fail\"",
            })
        }
    };
    let feedback = match value.get("feedback") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(_) => {
            return Err(MalformedOutput::WrongShape {
                shape,
                expected: "`feedback` string or null",
            })
        }
    };
    Ok(Verdict { status, feedback })
}

/// Accepts a bare array or an object wrapping one (`{"headings": [...]}`), which is what
/// JSON-mode models tend to return.
pub fn parse_heading_outline(raw: &str) -> Result<Vec<DetectedHeading>, MalformedOutput> {
    let shape = OutputShape::HeadingOutline;
    let value = parse_json(raw, shape)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .values()
            .find_map(Value::as_array)
            .ok_or(MalformedOutput::WrongShape {
                shape,
                expected: "an array of headings",
            })?,
        _ => {
            return Err(MalformedOutput::WrongShape {
                shape,
                expected: "an array of headings",
            })
        }
    };
    items
        .iter()
        .map(|item| {
            serde_json::from_value::<DetectedHeading>(item.clone()).map_err(|_| {
                MalformedOutput::WrongShape {
                    shape,
                    expected: "objects with heading_text, level and start_position",
                }
            })
        })
        .collect()
}
