// src/analyze/mod.rs
//! LLM sentiment analysis of converted disclosure text.

pub mod ai_adapter;
pub mod sentiment;

use std::time::Instant;

use metrics::counter;

use crate::error::AnalysisError;
use crate::metrics::{ANALYSES_COMPLETED, ANALYSIS_FAILURES};
use crate::model::AnalysisResult;

pub use ai_adapter::{build_client_from_config, DynLlm, LlmProvider};
pub use sentiment::{parse_analysis, ParsedAnalysis};

pub struct SentimentAnalyzer {
    client: DynLlm,
    max_input_chars: usize,
}

/// Successful analyses (with their input index) and how many failed.
#[derive(Debug, Default)]
pub struct BatchAnalysis {
    pub results: Vec<(usize, AnalysisResult)>,
    pub failed: usize,
}

impl SentimentAnalyzer {
    pub fn new(client: DynLlm, max_input_chars: usize) -> Self {
        Self {
            client,
            max_input_chars: max_input_chars.max(1),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.client.name()
    }

    pub async fn analyze(
        &self,
        text: &str,
        title_hint: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let title = title_hint.unwrap_or("");
        let input = sentiment::truncate_chars(text, self.max_input_chars);
        if input.len() < text.len() {
            tracing::debug!(target: "analyzer", title, cap = self.max_input_chars, "input text truncated");
        }

        let started = Instant::now();
        let outcome = match self.client.complete(&sentiment::build_prompt(input)).await {
            Ok(reply) => parse_analysis(
                &reply,
                self.client.model(),
                started.elapsed().as_millis() as u64,
            ),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(parsed) => {
                for a in &parsed.anomalies {
                    tracing::warn!(target: "analyzer", title, "analysis anomaly: {a}");
                }
                counter!(ANALYSES_COMPLETED).increment(1);
                tracing::info!(
                    target: "analyzer",
                    title,
                    sentiment = parsed.result.sentiment.as_str(),
                    insights = parsed.result.key_insights.len(),
                    elapsed_ms = parsed.result.processing_time_ms,
                    "analysis complete"
                );
                Ok(parsed.result)
            }
            Err(e) => {
                counter!(ANALYSIS_FAILURES).increment(1);
                Err(e)
            }
        }
    }

    /// Analyze `(text, title)` pairs sequentially, continuing past failures.
    pub async fn analyze_batch(&self, items: &[(String, Option<String>)]) -> BatchAnalysis {
        let mut out = BatchAnalysis::default();
        for (idx, (text, title)) in items.iter().enumerate() {
            match self.analyze(text, title.as_deref()).await {
                Ok(r) => out.results.push((idx, r)),
                Err(e) => {
                    tracing::warn!(
                        target: "analyzer",
                        index = idx,
                        total = items.len(),
                        "analysis failed: {e}"
                    );
                    out.failed += 1;
                }
            }
        }
        tracing::info!(
            target: "analyzer",
            ok = out.results.len(),
            failed = out.failed,
            "batch analysis complete"
        );
        out
    }
}
