//! Normalization of free-form model output into a [`ParsedResult`].
//!
//! Models are asked for bare JSON but frequently wrap it in a markdown code
//! fence, or ignore the instruction entirely. Parsing never fails: output that
//! does not decode is wrapped in a synthesized result so the user still sees
//! what the model said.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action assigned to a synthesized result.
pub const FALLBACK_ACTION: &str = "expand";

/// Title assigned to a synthesized result.
pub const FALLBACK_TITLE: &str = "AI Generated Note";

/// Language tags accepted after an opening fence, in match order.
const FENCE_LANGUAGES: [&str; 3] = ["json", "javascript", "js"];

const FENCE: &str = "```";

/// Structured outcome of one prompt.
///
/// Decoded objects are accepted as-is: known fields that the model left out
/// stay `None`, and any extra fields are carried in `extra`. A known field
/// holding a value of another type (say `"tags": "a,b"`) is not rejected; it
/// stays in `extra` under its own key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "Map<String, Value>")]
pub struct ParsedResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_points: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ParsedResult {
    /// Result synthesized when model output is not decodable.
    pub fn fallback(raw: &str) -> Self {
        Self {
            action: Some(FALLBACK_ACTION.to_string()),
            title: Some(FALLBACK_TITLE.to_string()),
            content: Some(raw.to_string()),
            tags: Some(Vec::new()),
            key_points: Some(Vec::new()),
            extra: Map::new(),
        }
    }

    /// Tags, treating an absent list as empty.
    pub fn tags(&self) -> &[String] {
        self.tags.as_deref().unwrap_or_default()
    }

    /// Content, if the model produced any non-empty text.
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.is_empty())
    }
}

impl From<Map<String, Value>> for ParsedResult {
    fn from(mut object: Map<String, Value>) -> Self {
        Self {
            action: take_field(&mut object, "action"),
            title: take_field(&mut object, "title"),
            content: take_field(&mut object, "content"),
            tags: take_field(&mut object, "tags"),
            key_points: take_field(&mut object, "keyPoints"),
            extra: object,
        }
    }
}

/// Remove `key` from `object` if its value decodes as `T`. `null` counts as
/// absent; any other value of the wrong type is left where it is.
fn take_field<T: DeserializeOwned>(object: &mut Map<String, Value>, key: &str) -> Option<T> {
    let value = object.get(key)?;
    if value.is_null() {
        object.remove(key);
        return None;
    }
    let decoded = T::deserialize(value).ok()?;
    object.remove(key);
    Some(decoded)
}

/// Remove one outer code fence pair, e.g. ```` ```json ... ``` ````.
///
/// The opening and closing fences are handled independently and only at the
/// outer boundary of the trimmed text; inner fences are left alone.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix(FENCE) {
        text = strip_language_tag(rest).trim_start();
    }
    if let Some(rest) = text.trim_end().strip_suffix(FENCE) {
        text = rest;
    }

    text.trim()
}

fn strip_language_tag(text: &str) -> &str {
    for lang in FENCE_LANGUAGES {
        if let Some(head) = text.get(..lang.len()) {
            if head.eq_ignore_ascii_case(lang) {
                return &text[lang.len()..];
            }
        }
    }
    text
}

/// Parse raw model output. Deterministic and side-effect free.
pub fn parse_model_output(raw: &str) -> ParsedResult {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str::<Value>(cleaned) {
        Ok(Value::Object(object)) => ParsedResult::from(object),
        Ok(_) => {
            tracing::debug!("model output is not a JSON object, using fallback");
            ParsedResult::fallback(raw)
        }
        Err(_) => ParsedResult::fallback(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str =
        r#"{"action":"summarize","title":"T","content":"C","tags":[],"keyPoints":[]}"#;

    fn summarize() -> ParsedResult {
        ParsedResult {
            action: Some("summarize".into()),
            title: Some("T".into()),
            content: Some("C".into()),
            tags: Some(vec![]),
            key_points: Some(vec![]),
            extra: Map::new(),
        }
    }

    #[test]
    fn fenced_json_is_decoded() {
        let raw = format!("```json\n{PLAIN}\n```");
        assert_eq!(parse_model_output(&raw), summarize());
    }

    #[test]
    fn fenced_and_bare_parse_identically() {
        let bodies = [
            PLAIN,
            r#"{"title":"only a title"}"#,
            r#"{"action":"question","tags":["a","b"],"extra":{"n":1}}"#,
        ];
        for body in bodies {
            for wrapped in [
                format!("```json\n{body}\n```"),
                format!("```JSON\n{body}\n```"),
                format!("```\n{body}\n```"),
                format!("  ```js {body}```  "),
            ] {
                assert_eq!(
                    parse_model_output(&wrapped),
                    parse_model_output(body),
                    "wrapped: {wrapped}"
                );
            }
        }
    }

    #[test]
    fn prose_falls_back() {
        let parsed = parse_model_output("just some prose");
        assert_eq!(parsed.action.as_deref(), Some("expand"));
        assert_eq!(parsed.title.as_deref(), Some("AI Generated Note"));
        assert_eq!(parsed.content.as_deref(), Some("just some prose"));
        assert_eq!(parsed.tags, Some(vec![]));
        assert_eq!(parsed.key_points, Some(vec![]));
    }

    #[test]
    fn fallback_keeps_original_unstripped_text() {
        let raw = "  ```json\nnot json at all\n```  ";
        let parsed = parse_model_output(raw);
        assert_eq!(parsed.content.as_deref(), Some(raw));
    }

    #[test]
    fn non_object_json_falls_back() {
        assert_eq!(parse_model_output("42"), ParsedResult::fallback("42"));
        assert_eq!(parse_model_output("[1,2]"), ParsedResult::fallback("[1,2]"));
    }

    #[test]
    fn mistyped_fields_keep_the_object() {
        let parsed = parse_model_output(
            r#"{"action":"summarize","title":"T","content":"C","tags":"a,b","keyPoints":[]}"#,
        );
        assert_eq!(parsed.action.as_deref(), Some("summarize"));
        assert_eq!(parsed.title.as_deref(), Some("T"));
        assert_eq!(parsed.content(), Some("C"));
        assert_eq!(parsed.key_points, Some(vec![]));
        assert!(parsed.tags.is_none());
        assert_eq!(parsed.extra["tags"], "a,b");
        assert!(parsed.tags().is_empty());
    }

    #[test]
    fn null_fields_are_absent() {
        let parsed = parse_model_output(r#"{"title":null,"content":"C"}"#);
        assert!(parsed.title.is_none());
        assert!(parsed.extra.is_empty());
    }

    #[test]
    fn mistyped_payload_survives_the_wire() {
        let parsed = parse_model_output(r#"{"title":7,"content":"C"}"#);
        let json = serde_json::to_string(&parsed).unwrap();
        let decoded: ParsedResult = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, parsed);
        assert_eq!(decoded.extra["title"], 7);
    }

    #[test]
    fn absent_fields_stay_absent_and_extras_survive() {
        let parsed = parse_model_output(r#"{"content":"body","mood":"calm"}"#);
        assert_eq!(parsed.content.as_deref(), Some("body"));
        assert!(parsed.title.is_none());
        assert!(parsed.tags.is_none());
        assert_eq!(parsed.extra["mood"], "calm");
        assert!(parsed.tags().is_empty());
    }

    #[test]
    fn only_outer_fences_are_stripped() {
        let raw = "```\n{\"content\":\"has ``` inside\"}\n```";
        assert_eq!(strip_code_fences(raw), "{\"content\":\"has ``` inside\"}");
    }

    #[test]
    fn strip_is_noop_without_fences() {
        assert_eq!(strip_code_fences("  {\"a\":1}\n"), "{\"a\":1}");
    }

    #[test]
    fn parse_is_deterministic() {
        let raw = "```json\n{\"action\":\"explain\"}\n```";
        assert_eq!(parse_model_output(raw), parse_model_output(raw));
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let json = serde_json::to_value(summarize()).unwrap();
        assert_eq!(json["keyPoints"], serde_json::json!([]));
        assert!(json.get("key_points").is_none());
    }
}
