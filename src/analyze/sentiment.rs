//! Prompt construction and strict parsing of the model's JSON reply.

use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AnalysisError;
use crate::model::{AnalysisResult, Sentiment};

pub const MAX_INSIGHTS: usize = 5;
pub const MIN_INSIGHTS: usize = 3;

pub fn build_prompt(text: &str) -> String {
    format!(
        r#"You are a financial analyst specializing in Australian Securities Exchange (ASX) company announcements.

Analyze the following company announcement and provide a structured analysis.

ANNOUNCEMENT CONTENT:
{text}

Reply with a single JSON object with exactly these fields:
{{
  "summary": "2-3 sentences covering the material information",
  "sentiment": "bullish|bearish|neutral",
  "key_insights": ["3 to 5 short insights an investor should know"],
  "financial_impact": "likely effect on share price and market position",
  "confidence_score": 0.0
}}

Sentiment is "bullish" for clearly positive news (growth, new contracts, upgrades),
"bearish" for clearly negative news (losses, downgrades, regulatory trouble) and
"neutral" for procedural or administrative notices.
confidence_score is a number between 0.0 and 1.0.
Return ONLY the JSON object, no additional text."#
    )
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Remove a leading ```` ``` ```` / ```` ```json ```` fence and a trailing fence.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```") {
        s = rest;
        if s.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
            s = &s[4..];
        }
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Parsed analysis plus the fallback rules that fired.
#[derive(Debug, Clone)]
pub struct ParsedAnalysis {
    pub result: AnalysisResult,
    pub anomalies: Vec<String>,
}

/// Any JSON value the model might put in a field.
#[derive(Deserialize)]
#[serde(untagged)]
enum Field {
    Text(String),
    Number(f64),
    List(Vec<Field>),
    Other(IgnoredAny),
}

impl Field {
    fn text(&self) -> Option<&str> {
        match self {
            Field::Text(s) => Some(s.trim()).filter(|s| !s.is_empty()),
            _ => None,
        }
    }
}

/// Reply object; every field is optional and type-lenient.
#[derive(Deserialize, Default)]
#[serde(default)]
struct Reply {
    summary: Option<Field>,
    sentiment: Option<Field>,
    key_insights: Option<Field>,
    financial_impact: Option<Field>,
    confidence_score: Option<Field>,
}

fn reply_object(body: &str) -> Result<Value, AnalysisError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(first) => {
            // prose around the object: fall back to the outermost braces
            match (body.find('{'), body.rfind('}')) {
                (Some(start), Some(end)) if end > start => serde_json::from_str(&body[start..=end])
                    .map_err(|_| AnalysisError::InvalidReply(first.to_string()))?,
                _ => return Err(AnalysisError::InvalidReply(first.to_string())),
            }
        }
    };
    if !value.is_object() {
        return Err(AnalysisError::InvalidReply("reply is not a JSON object".into()));
    }
    Ok(value)
}

pub fn parse_analysis(
    raw: &str,
    llm_model: &str,
    processing_time_ms: u64,
) -> Result<ParsedAnalysis, AnalysisError> {
    let body = strip_code_fences(raw);
    if body.is_empty() {
        return Err(AnalysisError::EmptyReply);
    }
    let reply: Reply = serde_json::from_value(reply_object(body)?)
        .map_err(|e| AnalysisError::InvalidReply(e.to_string()))?;

    let mut anomalies = Vec::new();

    let summary = reply
        .summary
        .as_ref()
        .and_then(Field::text)
        .unwrap_or_default()
        .to_string();
    if summary.is_empty() {
        anomalies.push("missing summary".to_string());
    }

    let sentiment = match reply.sentiment.as_ref().and_then(Field::text) {
        Some(raw) => Sentiment::parse(raw).unwrap_or_else(|| {
            anomalies.push(format!("unknown sentiment '{raw}', using neutral"));
            Sentiment::Neutral
        }),
        None => {
            anomalies.push("missing sentiment, using neutral".to_string());
            Sentiment::Neutral
        }
    };

    let mut key_insights: Vec<String> = match &reply.key_insights {
        Some(Field::List(items)) => items
            .iter()
            .filter_map(Field::text)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    if key_insights.len() > MAX_INSIGHTS {
        anomalies.push(format!("{} insights, keeping {MAX_INSIGHTS}", key_insights.len()));
        key_insights.truncate(MAX_INSIGHTS);
    } else if key_insights.len() < MIN_INSIGHTS {
        anomalies.push(format!("only {} insights", key_insights.len()));
    }

    let financial_impact = reply
        .financial_impact
        .as_ref()
        .and_then(Field::text)
        .map(str::to_string);

    let confidence_score = read_confidence(reply.confidence_score.as_ref(), &mut anomalies);

    Ok(ParsedAnalysis {
        result: AnalysisResult {
            summary,
            sentiment,
            key_insights,
            financial_impact,
            confidence_score,
            llm_model: llm_model.to_string(),
            processing_time_ms,
        },
        anomalies,
    })
}

/// The reply would parse into an analysis.
pub fn is_usable_reply(raw: &str) -> bool {
    parse_analysis(raw, "", 0).is_ok()
}

/// Missing or non-numeric means 0.0; out-of-range values are clamped.
fn read_confidence(value: Option<&Field>, anomalies: &mut Vec<String>) -> f64 {
    let raw = match value {
        Some(Field::Number(n)) => Some(*n),
        Some(Field::Text(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(c) if c.is_finite() => {
            if (0.0..=1.0).contains(&c) {
                c
            } else {
                anomalies.push(format!("confidence {c} clamped"));
                c.clamp(0.0, 1.0)
            }
        }
        _ => {
            anomalies.push("missing or non-numeric confidence, using 0.0".to_string());
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```JSON{}```"), "{}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {} "), "{}");
    }

    #[test]
    fn well_formed_reply() {
        let raw = r#"```json
        {"summary":"Record quarterly revenue.","sentiment":"Bullish",
         "key_insights":[" Revenue up 20% ","", "New contract","Guidance raised"],
         "financial_impact":"Positive","confidence_score":0.85}
        ```"#;
        let p = parse_analysis(raw, "gemini-1.5-pro", 120).unwrap();
        assert!(p.anomalies.is_empty(), "{:?}", p.anomalies);
        assert_eq!(p.result.sentiment, Sentiment::Bullish);
        assert_eq!(
            p.result.key_insights,
            vec!["Revenue up 20%", "New contract", "Guidance raised"]
        );
        assert_eq!(p.result.financial_impact.as_deref(), Some("Positive"));
        assert!((p.result.confidence_score - 0.85).abs() < 1e-9);
        assert_eq!(p.result.llm_model, "gemini-1.5-pro");
        assert_eq!(p.result.processing_time_ms, 120);
    }

    #[test]
    fn confidence_is_always_bounded() {
        for (raw, expected) in [
            (r#"{"confidence_score": 1.7}"#, 1.0),
            (r#"{"confidence_score": -3}"#, 0.0),
            (r#"{"confidence_score": "high"}"#, 0.0),
            (r#"{"confidence_score": "0.4"}"#, 0.4),
            (r#"{}"#, 0.0),
        ] {
            let p = parse_analysis(raw, "m", 0).unwrap();
            let c = p.result.confidence_score;
            assert!((0.0..=1.0).contains(&c));
            assert!((c - expected).abs() < 1e-9, "{raw} -> {c}");
        }
    }

    #[test]
    fn unknown_sentiment_and_insight_bounds() {
        let many: Vec<String> = (0..8).map(|i| format!("\"i{i}\"")).collect();
        let raw = format!(
            r#"{{"summary":"s","sentiment":"mixed","key_insights":[{}],"confidence_score":0.5}}"#,
            many.join(",")
        );
        let p = parse_analysis(&raw, "m", 0).unwrap();
        assert_eq!(p.result.sentiment, Sentiment::Neutral);
        assert_eq!(p.result.key_insights.len(), MAX_INSIGHTS);
        assert_eq!(p.anomalies.len(), 2);

        let few = parse_analysis(r#"{"summary":"s","sentiment":"bearish","key_insights":["one"],"confidence_score":0.5}"#, "m", 0).unwrap();
        assert_eq!(few.result.key_insights, vec!["one"]);
        assert_eq!(few.anomalies, vec!["only 1 insights".to_string()]);
    }

    #[test]
    fn prose_wrapped_object_and_invalid_replies() {
        let p = parse_analysis("Sure! {\"summary\":\"x\",\"sentiment\":\"neutral\"} Hope this helps.", "m", 0).unwrap();
        assert_eq!(p.result.summary, "x");
        assert!(matches!(parse_analysis("not json", "m", 0), Err(AnalysisError::InvalidReply(_))));
        assert!(matches!(parse_analysis("[1,2]", "m", 0), Err(AnalysisError::InvalidReply(_))));
        assert!(matches!(parse_analysis("```json\n```", "m", 0), Err(AnalysisError::EmptyReply)));
    }

    #[test]
    fn mistyped_fields_fall_back_instead_of_failing() {
        let raw = r#"{"summary":42,"sentiment":null,"key_insights":["a",7,{"x":1},"b","c"],"financial_impact":["n/a"],"confidence_score":true,"extra":"ignored"}"#;
        let p = parse_analysis(raw, "m", 0).unwrap();
        assert_eq!(p.result.summary, "");
        assert_eq!(p.result.sentiment, Sentiment::Neutral);
        assert_eq!(p.result.key_insights, vec!["a", "b", "c"]);
        assert_eq!(p.result.financial_impact, None);
        assert_eq!(p.result.confidence_score, 0.0);
        assert_eq!(p.anomalies.len(), 3);

        let insights_not_a_list = parse_analysis(r#"{"key_insights":"one"}"#, "m", 0).unwrap();
        assert!(insights_not_a_list.result.key_insights.is_empty());
    }

    #[test]
    fn usable_reply_check() {
        assert!(is_usable_reply(r#"{"summary":"s"}"#));
        assert!(!is_usable_reply("Sorry, I cannot help with that."));
        assert!(!is_usable_reply("  "));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
