//! Post-processing for captured analyzer output.
//!
//! The analyzer writes human-oriented text: ANSI color, spinner frames,
//! "Thinking..." filler, per-tool timing lines, and somewhere in the middle a
//! JSON payload whose framing has changed across analyzer releases. Cleaning
//! and extraction are pure and best-effort; they never fail the caller.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Cleaning
// ---------------------------------------------------------------------------

static ANSI_ESCAPES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[mK]").unwrap());
static SPINNER_GLYPHS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\u{280B}\u{2819}\u{2839}\u{2838}\u{283C}\u{2834}\u{2826}\u{2827}\u{2807}\u{280F}]").unwrap());
static THINKING_FILLER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Thinking\.\.\.").unwrap());
static TOOL_TIMING_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tool \w+ execution time: \d+ms").unwrap());
static NEWLINE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n+").unwrap());

/// Strip terminal decoration and progress noise from raw analyzer output.
///
/// Removes ANSI escape sequences, braille spinner frames, "Thinking..."
/// filler, and per-tool timing annotations, then collapses newline runs.
pub fn clean(raw: &str) -> String {
    let cleaned = ANSI_ESCAPES.replace_all(raw, "");
    let cleaned = SPINNER_GLYPHS.replace_all(&cleaned, "");
    let cleaned = THINKING_FILLER.replace_all(&cleaned, "");
    let cleaned = TOOL_TIMING_LINES.replace_all(&cleaned, "");
    NEWLINE_RUNS.replace_all(&cleaned, "\n").into_owned()
}

// ---------------------------------------------------------------------------
// Structured extraction ladder
// ---------------------------------------------------------------------------

/// One rung of the extraction ladder: a named pattern plus the capture group
/// holding the JSON candidate.
struct ExtractionStrategy {
    name: &'static str,
    pattern: Regex,
    group: usize,
}

/// Ordered ladder, tried top to bottom until a candidate parses.
///
/// Older analyzer builds framed results in a fenced block; later builds
/// emitted a bare object keyed `evaluation_results`, and the current ones use
/// `analysis_results`. All shapes must stay parseable, so new rungs are
/// appended here rather than replacing old ones.
static LADDER: LazyLock<Vec<ExtractionStrategy>> = LazyLock::new(|| {
    vec![
        ExtractionStrategy {
            name: "fenced-json-block",
            pattern: Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap(),
            group: 1,
        },
        ExtractionStrategy {
            name: "inline-evaluation-results",
            pattern: Regex::new(r#"\{[^\n]*"evaluation_results"[^\n]*\}"#).unwrap(),
            group: 0,
        },
        ExtractionStrategy {
            name: "inline-analysis-results",
            pattern: Regex::new(r#"\{[^\n]*"analysis_results"[^\n]*\}"#).unwrap(),
            group: 0,
        },
        ExtractionStrategy {
            name: "multiline-evaluation-results",
            pattern: Regex::new(r#"(?s)\{.*?"evaluation_results".*\}"#).unwrap(),
            group: 0,
        },
        ExtractionStrategy {
            name: "multiline-analysis-results",
            pattern: Regex::new(r#"(?s)\{.*?"analysis_results".*\}"#).unwrap(),
            group: 0,
        },
    ]
});

/// Pull a structured JSON payload out of (cleaned) analyzer output.
///
/// Walks the ladder in order; each rung's candidate must parse as JSON or the
/// rung is discarded and the next one is tried. Returns `None` when no rung
/// yields valid JSON — callers fall back to keeping the cleaned text.
pub fn extract_structured(raw: &str) -> Option<Value> {
    for strategy in LADDER.iter() {
        let Some(captures) = strategy.pattern.captures(raw) else {
            continue;
        };
        let Some(candidate) = captures.get(strategy.group) else {
            continue;
        };
        match serde_json::from_str::<Value>(candidate.as_str().trim()) {
            Ok(value) => {
                tracing::debug!(strategy = strategy.name, "structured output extracted");
                return Some(value);
            }
            Err(e) => {
                tracing::debug!(strategy = strategy.name, error = %e, "candidate did not parse, trying next rung");
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tool analytics
// ---------------------------------------------------------------------------

static TOOL_TIMING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tool (\w+) execution time: (\d+)ms").unwrap());

/// A single tool invocation reported in the analyzer's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTiming {
    pub tool: String,
    pub execution_time_ms: u64,
    pub execution_time_s: f64,
}

/// Aggregated per-run tool timings, in order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAnalytics {
    pub tools_executed: Vec<ToolTiming>,
    pub tool_count: usize,
    pub total_execution_time_ms: u64,
    pub total_execution_time_s: f64,
}

/// Scan raw (pre-clean) output for `Tool <name> execution time: <N>ms`
/// markers. Returns empty analytics when nothing matches.
pub fn extract_analytics(raw: &str) -> ToolAnalytics {
    let mut analytics = ToolAnalytics::default();

    for captures in TOOL_TIMING.captures_iter(raw) {
        let Ok(ms) = captures[2].parse::<u64>() else {
            continue;
        };
        analytics.tools_executed.push(ToolTiming {
            tool: captures[1].to_string(),
            execution_time_ms: ms,
            execution_time_s: round_secs(ms),
        });
        analytics.total_execution_time_ms += ms;
        analytics.tool_count += 1;
    }

    analytics.total_execution_time_s = round_secs(analytics.total_execution_time_ms);
    analytics
}

fn round_secs(ms: u64) -> f64 {
    (ms as f64 / 10.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_strips_ansi_and_spinner_noise() {
        let raw = "\x1b[32m⠋ Thinking...\x1b[0m\nresult line\n\n\nTool search execution time: 42ms\ndone";
        let cleaned = clean(raw);
        assert!(!cleaned.contains('\u{280B}'));
        assert!(!cleaned.contains("Thinking"));
        assert!(!cleaned.contains("execution time"));
        assert!(!cleaned.contains("\x1b["));
        assert!(cleaned.contains("result line\ndone"));
    }

    #[test]
    fn clean_collapses_newline_runs() {
        assert_eq!(clean("a\n\n\n\nb"), "a\nb");
    }

    #[test]
    fn clean_is_identity_on_plain_text() {
        let plain = "nothing special here";
        assert_eq!(clean(plain), plain);
    }

    #[test]
    fn fenced_block_is_extracted_exactly() {
        let raw = "noise before\n```json\n{\"evaluation_results\":[{\"x\":1}]}\n```\nnoise after";
        let value = extract_structured(raw).unwrap();
        assert_eq!(value, json!({"evaluation_results": [{"x": 1}]}));
    }

    #[test]
    fn inline_evaluation_results_object() {
        let raw = "log line\n{\"evaluation_results\": {\"score\": 3}}\ntrailer";
        let value = extract_structured(raw).unwrap();
        assert_eq!(value["evaluation_results"]["score"], 3);
    }

    #[test]
    fn inline_analysis_results_object() {
        let raw = "{\"analysis_results\": [\"a\", \"b\"]}";
        let value = extract_structured(raw).unwrap();
        assert_eq!(value["analysis_results"][0], "a");
    }

    #[test]
    fn multiline_object_is_extracted() {
        let raw = "prefix\n{\n  \"analysis_results\": {\n    \"ok\": true\n  }\n}";
        let value = extract_structured(raw).unwrap();
        assert_eq!(value["analysis_results"]["ok"], true);
    }

    #[test]
    fn invalid_fenced_candidate_falls_through_to_next_rung() {
        let raw = "```json\nnot json at all\n```\n{\"analysis_results\": 1}";
        let value = extract_structured(raw).unwrap();
        assert_eq!(value["analysis_results"], 1);
    }

    #[test]
    fn no_structured_payload_returns_none() {
        assert!(extract_structured("just some log output, no json").is_none());
        assert!(extract_structured("").is_none());
    }

    #[test]
    fn extraction_is_idempotent_on_its_own_output() {
        let raw = "```json\n{\"evaluation_results\":[{\"x\":1}]}\n```";
        let first = extract_structured(raw).unwrap();

        let refenced = format!("```json\n{}\n```", serde_json::to_string(&first).unwrap());
        let second = extract_structured(&clean(&refenced)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn analytics_requires_marker_word_boundary() {
        let raw = "Tool alpha execution time: 120ms\nToolbeta execution time: 80ms";
        let analytics = extract_analytics(raw);
        assert_eq!(analytics.tool_count, 1);
        assert_eq!(analytics.tools_executed[0].tool, "alpha");
        assert_eq!(analytics.tools_executed[0].execution_time_ms, 120);
        assert_eq!(analytics.total_execution_time_ms, 120);
    }

    #[test]
    fn analytics_preserves_order_and_sums() {
        let raw = "Tool grep execution time: 1500ms\nmid\nTool read execution time: 250ms";
        let analytics = extract_analytics(raw);
        assert_eq!(analytics.tool_count, 2);
        assert_eq!(analytics.tools_executed[0].tool, "grep");
        assert_eq!(analytics.tools_executed[1].tool, "read");
        assert_eq!(analytics.total_execution_time_ms, 1750);
        assert_eq!(analytics.total_execution_time_s, 1.75);
        assert_eq!(analytics.tools_executed[0].execution_time_s, 1.5);
    }

    #[test]
    fn analytics_empty_on_no_markers() {
        let analytics = extract_analytics("no tools ran here");
        assert_eq!(analytics, ToolAnalytics::default());
    }
}
