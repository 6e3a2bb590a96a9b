use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::Scan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    #[serde(other)]
    Unknown,
}

/// Structured letter analysis extracted from the worker's free-text reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAnalysis {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub suggested_replies: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("analysis has no text content")]
    MissingText,

    #[error("analysis text contains no JSON object")]
    NoJsonObject,

    #[error("analysis JSON is invalid: {0}")]
    InvalidJson(String),
}

/// What a consumer should make of a scan's analysis
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisStatus {
    Pending,
    Ready(ParsedAnalysis),
    /// Present but unparseable. Shown like `Pending`; the synchronizer logs
    /// it once when it is merged.
    Unreadable(ParseFailure),
}

impl AnalysisStatus {
    pub fn of(scan: &Scan) -> Self {
        let Some(raw) = scan.analysis.as_ref().filter(|v| !v.is_null()) else {
            return AnalysisStatus::Pending;
        };
        match parse_analysis(raw) {
            Ok(parsed) => AnalysisStatus::Ready(parsed),
            Err(failure) => AnalysisStatus::Unreadable(failure),
        }
    }

    /// The parsed analysis, or `None` for both "not yet" and "unreadable"
    pub fn ready(&self) -> Option<&ParsedAnalysis> {
        match self {
            AnalysisStatus::Ready(parsed) => Some(parsed),
            _ => None,
        }
    }

    pub fn is_still_analyzing(&self) -> bool {
        self.ready().is_none()
    }
}

/// Extract the analysis object. The worker stores a message-shaped payload
/// (`content[0].text`) whose text holds a JSON object, usually inside a
/// fenced code block. A bare JSON string or an already structured object
/// are accepted as well.
pub fn parse_analysis(raw: &Value) -> Result<ParsedAnalysis, ParseFailure> {
    let text = match raw {
        Value::String(text) => text.as_str(),
        Value::Object(map) if !map.contains_key("content") => {
            return serde_json::from_value(raw.clone())
                .map_err(|e| ParseFailure::InvalidJson(e.to_string()));
        }
        _ => raw
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or(ParseFailure::MissingText)?,
    };

    let body = extract_json_object(text).ok_or(ParseFailure::NoJsonObject)?;
    serde_json::from_str(body).map_err(|e| ParseFailure::InvalidJson(e.to_string()))
}

/// The JSON object inside `text`, preferring the body of a fenced block
fn extract_json_object(text: &str) -> Option<&str> {
    fenced_body(text)
        .and_then(object_span)
        .or_else(|| object_span(text))
}

fn object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

fn fenced_body(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // Info string such as `json`, possibly on the same line as the body
    let body =
        after_fence.trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    let close = body.find("```").unwrap_or(body.len());
    Some(&body[..close])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(text: &str) -> Value {
        json!({ "content": [{ "type": "text", "text": text }] })
    }

    #[test]
    fn test_fenced_json() {
        let raw = message(
            "Here you go:\n```json\n{\"sender\": \"Finanzamt\", \"urgency\": \"high\", \"suggested_replies\": [\"Einspruch\"]}\n```\nDone.",
        );
        let parsed = parse_analysis(&raw).unwrap();
        assert_eq!(parsed.sender.as_deref(), Some("Finanzamt"));
        assert_eq!(parsed.urgency, Some(Urgency::High));
        assert_eq!(parsed.suggested_replies, vec!["Einspruch".to_string()]);
    }

    #[test]
    fn test_unfenced_json_and_extra_keys() {
        let raw = message("{\"deadline\": \"2026-11-01\", \"urgency\": \"soon\", \"reference\": \"AZ-7\"}");
        let parsed = parse_analysis(&raw).unwrap();
        assert_eq!(parsed.deadline.as_deref(), Some("2026-11-01"));
        assert_eq!(parsed.urgency, Some(Urgency::Unknown));
        assert_eq!(parsed.extra.get("reference"), Some(&json!("AZ-7")));
    }

    #[test]
    fn test_not_json_is_unavailable() {
        assert_eq!(
            parse_analysis(&message("not json")),
            Err(ParseFailure::NoJsonObject)
        );
        assert!(matches!(
            parse_analysis(&message("```json\n{ broken }\n```")),
            Err(ParseFailure::InvalidJson(_))
        ));
        assert_eq!(
            parse_analysis(&json!({ "content": [] })),
            Err(ParseFailure::MissingText)
        );
    }

    #[test]
    fn test_single_line_fence_followed_by_prose() {
        let raw = message("```json {\"sender\": \"Amt\"} ```\nLet me know if you need more.");
        let parsed = parse_analysis(&raw).unwrap();
        assert_eq!(parsed.sender.as_deref(), Some("Amt"));
    }

    #[test]
    fn test_fence_without_object_falls_back_to_full_text() {
        let raw = message("```\nno data here\n```\n{\"subject\": \"Mahnung\"}");
        let parsed = parse_analysis(&raw).unwrap();
        assert_eq!(parsed.subject.as_deref(), Some("Mahnung"));
    }

    #[test]
    fn test_structured_object_accepted() {
        let parsed = parse_analysis(&json!({ "sender": "Jobcenter" })).unwrap();
        assert_eq!(parsed.sender.as_deref(), Some("Jobcenter"));
    }

    #[test]
    fn test_status_shows_unreadable_as_still_analyzing() {
        let mut scan = Scan {
            id: "s1".to_string(),
            image_url: "http://img".to_string(),
            created_at: chrono::Utc::now(),
            language: crate::models::Language::De,
            owner_id: "u1".to_string(),
            analysis: None,
        };
        assert_eq!(AnalysisStatus::of(&scan), AnalysisStatus::Pending);

        scan.analysis = Some(message("not json"));
        let status = AnalysisStatus::of(&scan);
        assert!(matches!(status, AnalysisStatus::Unreadable(_)));
        assert!(status.is_still_analyzing());
    }
}
