//! Moderator decision parsing, message validation, and convergence scoring.
//!
//! The moderator LLM is asked for JSON-only output, but the parser assumes
//! the worst: it extracts the first balanced object from whatever came back,
//! matches keys case-insensitively, coerces missing fields to defaults, and
//! clamps the convergence score. Any failure yields the fallback decision
//! (continue with all panelists, score zero) so a flaky moderator can never
//! stall a discussion.

use regex::Regex;
use serde_json::Value;

use crate::agentdesk::agent::{MessageType, PanelMessage};
use crate::agentdesk::config::PanelSettings;
use crate::agentdesk::protocol::{extract_json_object, get_ci};

/// Phrases that signal a panelist is agreeing with or building on others.
pub const AGREEMENT_SIGNALS: [&str; 10] = [
    "i agree",
    "building on",
    "as mentioned",
    "echoing",
    "consistent with",
    "aligning with",
    "in line with",
    "similar to what",
    "reinforcing",
    "corroborating",
];

/// How many trailing panelist messages the detector inspects.
const RECENT_WINDOW: usize = 6;

/// The moderator's turn decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeratorDecision {
    /// `None` means a full round-robin turn.
    pub next_speaker: Option<String>,
    /// The moderator's own read of convergence, `0..=100`.
    pub convergence_score: u32,
    pub stop_discussion: bool,
    pub reason: Option<String>,
    /// Optional steer injected into panelist prompts this turn.
    pub redirect_message: Option<String>,
    pub allow_parallel_thinking: bool,
    pub parallel_group: Vec<String>,
    pub parallel_rationale: Option<String>,
}

impl ModeratorDecision {
    /// The fail-open default: keep going with everyone.
    pub fn fallback() -> Self {
        Self {
            next_speaker: None,
            convergence_score: 0,
            stop_discussion: false,
            reason: None,
            redirect_message: None,
            allow_parallel_thinking: false,
            parallel_group: Vec::new(),
            parallel_rationale: None,
        }
    }
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    get_ci(obj, key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Decode a moderator reply into a decision, falling back on any error.
pub fn parse_moderator_decision(text: &str) -> ModeratorDecision {
    let raw = match extract_json_object(text) {
        Some(raw) => raw,
        None => return ModeratorDecision::fallback(),
    };
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => return ModeratorDecision::fallback(),
    };
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return ModeratorDecision::fallback(),
    };

    let convergence_score = get_ci(obj, "convergenceScore")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .clamp(0, 100) as u32;

    let parallel_group = get_ci(obj, "parallelGroup")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    ModeratorDecision {
        next_speaker: string_field(obj, "nextSpeaker"),
        convergence_score,
        stop_discussion: get_ci(obj, "stopDiscussion").and_then(Value::as_bool).unwrap_or(false),
        reason: string_field(obj, "reason"),
        redirect_message: string_field(obj, "redirectMessage"),
        allow_parallel_thinking: get_ci(obj, "allowParallelThinking")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        parallel_group,
        parallel_rationale: string_field(obj, "parallelRationale"),
    }
}

/// Verdict on one produced panel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeratorVerdict {
    Accept,
    /// Drop this message, keep discussing.
    Blocked(String),
    /// End the discussion now; a hard budget was exhausted.
    ForceConverge(String),
}

/// Local, deterministic validation applied after each panelist message.
pub struct MessageValidator {
    prohibited: Vec<Regex>,
    max_tokens_per_turn: usize,
    max_total_tokens: usize,
    max_tool_calls: usize,
}

impl MessageValidator {
    /// Compile the configured prohibited patterns; invalid ones are logged
    /// and skipped rather than failing panel preparation.
    pub fn new(settings: &PanelSettings) -> Self {
        let prohibited = settings
            .prohibited_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    log::warn!("skipping invalid prohibited pattern '{}': {}", pattern, err);
                    None
                }
            })
            .collect();
        Self {
            prohibited,
            max_tokens_per_turn: settings.max_tokens_per_turn,
            max_total_tokens: settings.max_total_tokens,
            max_tool_calls: settings.max_tool_calls,
        }
    }

    /// Four characters per token, the usual rough estimate.
    pub fn estimate_tokens(content: &str) -> usize {
        content.len() / 4
    }

    pub fn validate(
        &self,
        content: &str,
        tokens_spent: usize,
        tool_calls_made: usize,
    ) -> ModeratorVerdict {
        if tokens_spent >= self.max_total_tokens {
            return ModeratorVerdict::ForceConverge(format!(
                "token budget exhausted ({} of {})",
                tokens_spent, self.max_total_tokens
            ));
        }
        if tool_calls_made >= self.max_tool_calls {
            return ModeratorVerdict::ForceConverge(format!(
                "tool call budget exhausted ({} of {})",
                tool_calls_made, self.max_tool_calls
            ));
        }
        for regex in &self.prohibited {
            if regex.is_match(content) {
                return ModeratorVerdict::Blocked(format!(
                    "message matches prohibited pattern '{}'",
                    regex.as_str()
                ));
            }
        }
        if Self::estimate_tokens(content) > self.max_tokens_per_turn {
            return ModeratorVerdict::Blocked(format!(
                "message exceeds {} tokens per turn",
                self.max_tokens_per_turn
            ));
        }
        ModeratorVerdict::Accept
    }
}

/// Result of one convergence evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub score: u32,
    pub converged: bool,
    /// False when the cadence gate skipped scoring this turn.
    pub evaluated: bool,
}

/// Heuristic convergence score over the recent discussion window.
///
/// Scoring only runs from turn four onward, every third turn; a discussion
/// past its turn limit is force-converged regardless of content. The score
/// sums agreement signals (up to 40), shrinking message lengths (20 below
/// 0.7x plus 10 below 0.85x), turn progress (up to 20), and full panelist
/// participation (10), capped at 100.
pub fn evaluate_convergence(
    messages: &[PanelMessage],
    turn: u64,
    max_turns: u64,
    threshold: u32,
    panelist_names: &[String],
) -> ConvergenceReport {
    if turn > max_turns {
        return ConvergenceReport { score: 100, converged: true, evaluated: true };
    }
    if turn < 4 || turn % 3 != 0 {
        return ConvergenceReport { score: 0, converged: false, evaluated: false };
    }

    let window: Vec<&PanelMessage> = messages
        .iter()
        .filter(|m| m.message_type == MessageType::PanelistArgument)
        .rev()
        .take(RECENT_WINDOW)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let mut score = 0.0f64;

    if !window.is_empty() {
        let matching = window
            .iter()
            .filter(|m| {
                let lowered = m.content.to_lowercase();
                AGREEMENT_SIGNALS.iter().any(|signal| lowered.contains(signal))
            })
            .count();
        score += 40.0 * matching as f64 / window.len() as f64;
    }

    if window.len() >= 2 {
        let mid = window.len() / 2;
        let first_avg = window[..mid]
            .iter()
            .map(|m| m.content.chars().count())
            .sum::<usize>() as f64
            / mid as f64;
        let second_avg = window[mid..]
            .iter()
            .map(|m| m.content.chars().count())
            .sum::<usize>() as f64
            / (window.len() - mid) as f64;
        if first_avg > 0.0 {
            let ratio = second_avg / first_avg;
            if ratio < 0.7 {
                score += 20.0;
            }
            if ratio < 0.85 {
                score += 10.0;
            }
        }
    }

    if max_turns > 0 {
        score += 20.0 * (turn as f64 / max_turns as f64).min(1.0);
    }

    let all_present = !panelist_names.is_empty()
        && panelist_names
            .iter()
            .all(|name| window.iter().any(|m| &m.author_name == name));
    if all_present {
        score += 10.0;
    }

    let score = score.min(100.0).round() as u32;
    ConvergenceReport { score, converged: score >= threshold, evaluated: true }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentdesk::agent::AgentRole;
    use chrono::Utc;

    fn panelist_message(author: &str, content: &str) -> PanelMessage {
        PanelMessage {
            session_id: "sess".to_string(),
            author_agent_id: 1,
            author_name: author.to_string(),
            author_role: AgentRole::Panelist,
            content: content.to_string(),
            message_type: MessageType::PanelistArgument,
            in_reply_to: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn decision_parses_wrapped_json_with_mixed_case_keys() {
        let reply = r#"Sure, here is my decision:
            {"NextSpeaker": "Skeptic", "convergencescore": 140,
             "stopDiscussion": false, "AllowParallelThinking": true,
             "parallelGroup": ["Analyst", "Skeptic"], "reason": "contrast"}"#;
        let decision = parse_moderator_decision(reply);
        assert_eq!(decision.next_speaker.as_deref(), Some("Skeptic"));
        assert_eq!(decision.convergence_score, 100);
        assert!(decision.allow_parallel_thinking);
        assert_eq!(decision.parallel_group, vec!["Analyst", "Skeptic"]);
        assert!(!decision.stop_discussion);
    }

    #[test]
    fn unparseable_reply_yields_fallback() {
        let decision = parse_moderator_decision("I cannot decide right now.");
        assert_eq!(decision, ModeratorDecision::fallback());
        assert_eq!(decision.convergence_score, 0);
        assert!(decision.next_speaker.is_none());
    }

    #[test]
    fn null_next_speaker_means_round_robin() {
        let decision =
            parse_moderator_decision(r#"{"nextSpeaker": null, "convergenceScore": 10}"#);
        assert!(decision.next_speaker.is_none());
        assert_eq!(decision.convergence_score, 10);
    }

    #[test]
    fn validator_blocks_prohibited_and_oversized_messages() {
        let settings = PanelSettings {
            prohibited_patterns: vec!["(?i)launch the missiles".to_string()],
            max_tokens_per_turn: 10,
            ..PanelSettings::default()
        };
        let validator = MessageValidator::new(&settings);

        assert!(matches!(
            validator.validate("Launch the Missiles now", 0, 0),
            ModeratorVerdict::Blocked(_)
        ));
        let oversized = "x".repeat(100);
        assert!(matches!(
            validator.validate(&oversized, 0, 0),
            ModeratorVerdict::Blocked(_)
        ));
        assert_eq!(validator.validate("short and safe", 0, 0), ModeratorVerdict::Accept);
    }

    #[test]
    fn validator_forces_convergence_on_exhausted_budgets() {
        let settings = PanelSettings {
            max_total_tokens: 100,
            max_tool_calls: 5,
            ..PanelSettings::default()
        };
        let validator = MessageValidator::new(&settings);

        assert!(matches!(
            validator.validate("fine", 100, 0),
            ModeratorVerdict::ForceConverge(_)
        ));
        assert!(matches!(
            validator.validate("fine", 0, 5),
            ModeratorVerdict::ForceConverge(_)
        ));
    }

    #[test]
    fn cadence_gate_skips_early_and_off_beat_turns() {
        let messages = vec![panelist_message("Analyst", "I agree with that")];
        let names = vec!["Analyst".to_string()];
        assert!(!evaluate_convergence(&messages, 3, 20, 80, &names).evaluated);
        assert!(!evaluate_convergence(&messages, 5, 20, 80, &names).evaluated);
        assert!(evaluate_convergence(&messages, 6, 20, 80, &names).evaluated);
    }

    #[test]
    fn turn_limit_forces_convergence() {
        let report = evaluate_convergence(&[], 21, 20, 80, &[]);
        assert!(report.converged);
        assert_eq!(report.score, 100);
    }

    #[test]
    fn agreement_heavy_window_converges() {
        let long = "Building on the earlier analysis, here is a very long and \
                    detailed argument that lays out the full reasoning with \
                    plenty of supporting material and context for everyone.";
        let short = "I agree, that settles it.";
        let messages = vec![
            panelist_message("Analyst", long),
            panelist_message("Skeptic", long),
            panelist_message("Pragmatist", &format!("I agree, {}", long)),
            panelist_message("Analyst", short),
            panelist_message("Skeptic", short),
            panelist_message("Pragmatist", short),
        ];
        let names = vec![
            "Analyst".to_string(),
            "Skeptic".to_string(),
            "Pragmatist".to_string(),
        ];

        let report = evaluate_convergence(&messages, 6, 20, 80, &names);
        assert!(report.evaluated);
        assert!(report.score >= 80, "expected >= 80, got {}", report.score);
        assert!(report.converged);
    }

    #[test]
    fn disagreement_does_not_converge() {
        let messages: Vec<PanelMessage> = (0..6)
            .map(|i| {
                panelist_message(
                    &format!("P{}", i % 3),
                    "No, that is wrong, and here is a completely different view.",
                )
            })
            .collect();
        let names = vec!["P0".to_string(), "P1".to_string(), "P2".to_string()];

        let report = evaluate_convergence(&messages, 6, 20, 80, &names);
        assert!(report.evaluated);
        assert!(!report.converged);
    }
}
