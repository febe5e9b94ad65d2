//! Continuation strategy: decides whether an agent autonomously takes
//! another turn.
//!
//! An explicit `continuation` block in a structured response always wins.
//! Without one, the policy either terminates (`require_explicit_signal`,
//! the default) or falls back to regex patterns over the free-form text,
//! where termination patterns take precedence. Hard iteration and time
//! budgets force termination regardless of what the model says.

use crate::config::ContinuationConfig;
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContinuationStatus {
    #[serde(rename = "CONTINUE")]
    Continue,
    #[serde(rename = "TERMINATE")]
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NextAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContinuationProgress {
    #[serde(default)]
    pub current_step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_percentage: Option<f64>,
    #[serde(default)]
    pub steps_completed: Vec<String>,
    #[serde(default)]
    pub steps_remaining: Vec<String>,
}

/// The continuation block a model may embed in a structured response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContinuationState {
    pub status: ContinuationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_action: Option<NextAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ContinuationProgress>,
}

/// What the controller inspects after each turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRecord {
    pub response_text: String,
    /// Parsed structured response, when the model produced one.
    pub structured: Option<serde_json::Value>,
    pub tool_calls_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub iteration: usize,
    pub timestamp: DateTime<Utc>,
    pub response_summary: String,
    pub continuation_status: String,
    pub tool_calls_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ContinuationProgress>,
}

const RESPONSE_SUMMARY_LIMIT: usize = 200;

pub struct ContinuationStrategy {
    config: ContinuationConfig,
    continuation_patterns: Vec<regex::Regex>,
    termination_patterns: Vec<regex::Regex>,
    started_at: Option<Instant>,
    iteration_count: usize,
    history: Vec<HistoryEntry>,
    latest_progress: Option<ContinuationProgress>,
}

fn compile(patterns: &[&str]) -> Vec<regex::Regex> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .expect("builtin continuation pattern compiles")
        })
        .collect()
}

impl ContinuationStrategy {
    pub fn new(config: ContinuationConfig) -> Self {
        Self {
            config,
            continuation_patterns: compile(&[
                r"\bCONTINUE\b",
                r#""status":\s*"CONTINUE""#,
                r"need.*more.*steps",
                r"not.*finished",
            ]),
            termination_patterns: compile(&[
                r"\bTERMINATE\b",
                r#""status":\s*"TERMINATE""#,
                r"task.*completed",
                r"finished.*successfully",
            ]),
            started_at: None,
            iteration_count: 0,
            history: Vec::new(),
            latest_progress: None,
        }
    }

    pub fn config(&self) -> &ContinuationConfig {
        &self.config
    }

    /// Start a new operation: clears counters, the clock, and history.
    pub fn reset(&mut self) {
        self.started_at = Some(Instant::now());
        self.iteration_count = 0;
        self.history.clear();
        self.latest_progress = None;
    }

    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Whether another autonomous turn should run.
    pub fn should_continue(&self, turn: &TurnRecord) -> bool {
        if !self.within_safety_limits() {
            warn!("continuation safety limits reached, forcing termination");
            return false;
        }

        if let Some(state) = self.extract_state(turn) {
            let keep_going = state.status == ContinuationStatus::Continue;
            info!(
                continue_ = keep_going,
                reason = state.reason.as_deref().unwrap_or("no reason provided"),
                "explicit continuation signal"
            );
            return keep_going;
        }

        if self.config.require_explicit_signal {
            debug!("no explicit continuation signal, defaulting to terminate");
            return false;
        }

        // Termination patterns win ties.
        for pattern in &self.termination_patterns {
            if pattern.is_match(&turn.response_text) {
                debug!(pattern = pattern.as_str(), "termination pattern matched");
                return false;
            }
        }
        for pattern in &self.continuation_patterns {
            if pattern.is_match(&turn.response_text) {
                debug!(pattern = pattern.as_str(), "continuation pattern matched");
                return true;
            }
        }
        false
    }

    /// The structured continuation block, if the response carried one.
    pub fn extract_state(&self, turn: &TurnRecord) -> Option<ContinuationState> {
        let block = turn.structured.as_ref()?.get("continuation")?;
        serde_json::from_value(block.clone()).ok()
    }

    /// The next action: an explicit `next_action`, or the first pending
    /// tool call converted into one.
    pub fn extract_next_action(&self, turn: &TurnRecord) -> Option<NextAction> {
        if let Some(state) = self.extract_state(turn) {
            if state.next_action.is_some() {
                return state.next_action;
            }
        }
        let tool_calls = turn.structured.as_ref()?.get("tool_calls")?.as_array()?;
        let first = tool_calls.first()?;
        Some(NextAction {
            kind: "tool_call".to_string(),
            tool: first
                .pointer("/function/name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            parameters: first
                .pointer("/function/arguments")
                .cloned()
                .unwrap_or(serde_json::json!({})),
        })
    }

    /// Record a finished iteration and return its history entry.
    pub fn record_iteration(&mut self, turn: &TurnRecord) -> &HistoryEntry {
        self.iteration_count += 1;

        let state = self.extract_state(turn);
        let status = match &state {
            Some(s) => match s.status {
                ContinuationStatus::Continue => "CONTINUE",
                ContinuationStatus::Terminate => "TERMINATE",
            },
            None => "UNKNOWN",
        };
        let progress = state.and_then(|s| s.progress);
        if progress.is_some() {
            self.latest_progress = progress.clone();
        }

        let mut summary: String = turn
            .response_text
            .chars()
            .take(RESPONSE_SUMMARY_LIMIT)
            .collect();
        if turn.response_text.chars().count() > RESPONSE_SUMMARY_LIMIT {
            summary.push_str("...");
        }

        self.history.push(HistoryEntry {
            iteration: self.iteration_count,
            timestamp: Utc::now(),
            response_summary: summary,
            continuation_status: status.to_string(),
            tool_calls_count: turn.tool_calls_count,
            progress,
        });
        self.history.last().expect("entry just pushed")
    }

    /// Progress for status queries: the latest explicit progress block, or
    /// one synthesized from history.
    pub fn progress(&self) -> ContinuationProgress {
        if let Some(progress) = &self.latest_progress {
            return progress.clone();
        }
        ContinuationProgress {
            current_step: self.history.len() as u32,
            ..Default::default()
        }
    }

    fn within_safety_limits(&self) -> bool {
        if self.iteration_count >= self.config.max_iterations {
            warn!(
                max = self.config.max_iterations,
                "reached maximum continuation iterations"
            );
            return false;
        }
        if let Some(started) = self.started_at {
            if started.elapsed().as_secs() >= self.config.timeout_secs {
                warn!(timeout = self.config.timeout_secs, "continuation timeout reached");
                return false;
            }
        }
        true
    }
}

/// Message injected for single-tool models that stopped without an explicit
/// terminate signal.
pub fn continuation_message() -> &'static str {
    "Please continue with the next step based on the continuation protocol."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(require_explicit: bool) -> ContinuationStrategy {
        let mut strategy = ContinuationStrategy::new(ContinuationConfig {
            require_explicit_signal: require_explicit,
            ..Default::default()
        });
        strategy.reset();
        strategy
    }

    fn turn_with_block(status: &str) -> TurnRecord {
        TurnRecord {
            response_text: "working".into(),
            structured: Some(serde_json::json!({
                "continuation": {"status": status, "reason": "because"}
            })),
            tool_calls_count: 0,
        }
    }

    #[test]
    fn explicit_continue_wins() {
        let strategy = strategy(true);
        assert!(strategy.should_continue(&turn_with_block("CONTINUE")));
        assert!(!strategy.should_continue(&turn_with_block("TERMINATE")));
    }

    #[test]
    fn missing_signal_terminates_when_required() {
        let strategy = strategy(true);
        let turn = TurnRecord {
            response_text: "CONTINUE with more work".into(),
            ..Default::default()
        };
        assert!(!strategy.should_continue(&turn));
    }

    #[test]
    fn pattern_fallback_detects_continue() {
        let strategy = strategy(false);
        let turn = TurnRecord {
            response_text: "I am not finished yet".into(),
            ..Default::default()
        };
        assert!(strategy.should_continue(&turn));
    }

    #[test]
    fn termination_patterns_take_precedence() {
        let strategy = strategy(false);
        let turn = TurnRecord {
            response_text: "CONTINUE? No: task completed.".into(),
            ..Default::default()
        };
        assert!(!strategy.should_continue(&turn));
    }

    #[test]
    fn no_patterns_means_terminate() {
        let strategy = strategy(false);
        let turn = TurnRecord {
            response_text: "All quiet.".into(),
            ..Default::default()
        };
        assert!(!strategy.should_continue(&turn));
    }

    #[test]
    fn iteration_limit_forces_terminate() {
        let mut strategy = ContinuationStrategy::new(ContinuationConfig {
            max_iterations: 3,
            require_explicit_signal: true,
            ..Default::default()
        });
        strategy.reset();
        let turn = turn_with_block("CONTINUE");

        let mut continues = 0;
        for _ in 0..10 {
            if strategy.should_continue(&turn) {
                continues += 1;
                strategy.record_iteration(&turn);
            } else {
                break;
            }
        }
        assert_eq!(continues, 3);
        assert_eq!(strategy.iteration_count(), 3);
    }

    #[test]
    fn timeout_forces_terminate() {
        let mut strategy = ContinuationStrategy::new(ContinuationConfig {
            timeout_secs: 0,
            ..Default::default()
        });
        strategy.reset();
        assert!(!strategy.should_continue(&turn_with_block("CONTINUE")));
    }

    #[test]
    fn history_truncates_long_summaries() {
        let mut strategy = strategy(true);
        let turn = TurnRecord {
            response_text: "x".repeat(500),
            ..Default::default()
        };
        let entry = strategy.record_iteration(&turn);
        assert_eq!(entry.response_summary.len(), RESPONSE_SUMMARY_LIMIT + 3);
        assert!(entry.response_summary.ends_with("..."));
        assert_eq!(entry.continuation_status, "UNKNOWN");
    }

    #[test]
    fn next_action_from_block_then_tool_calls() {
        let strategy = strategy(true);
        let turn = TurnRecord {
            structured: Some(serde_json::json!({
                "continuation": {
                    "status": "CONTINUE",
                    "next_action": {"type": "tool_call", "tool": "run_tests", "parameters": {}}
                }
            })),
            ..Default::default()
        };
        assert_eq!(strategy.extract_next_action(&turn).unwrap().tool, "run_tests");

        let turn = TurnRecord {
            structured: Some(serde_json::json!({
                "tool_calls": [{"function": {"name": "read_file", "arguments": {"path": "x"}}}]
            })),
            ..Default::default()
        };
        let action = strategy.extract_next_action(&turn).unwrap();
        assert_eq!(action.kind, "tool_call");
        assert_eq!(action.tool, "read_file");
    }

    #[test]
    fn progress_prefers_explicit_block() {
        let mut strategy = strategy(true);
        let turn = TurnRecord {
            structured: Some(serde_json::json!({
                "continuation": {
                    "status": "CONTINUE",
                    "progress": {"current_step": 2, "total_steps": 5}
                }
            })),
            ..Default::default()
        };
        strategy.record_iteration(&turn);
        let progress = strategy.progress();
        assert_eq!(progress.current_step, 2);
        assert_eq!(progress.total_steps, Some(5));
    }
}
