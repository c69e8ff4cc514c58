//! Post-discussion knowledge briefs and follow-up answering.
//!
//! After synthesis the head is asked, in a throwaway session, to compress the
//! discussion into a small structured brief. The brief is generated once at
//! completion and reused for every follow-up question, so follow-ups never
//! replay the transcript.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::agentdesk::agent::{short_id, MessageType, PanelMessage};
use crate::agentdesk::chat_client::ChatClient;
use crate::agentdesk::error::OrchestratorResult;
use crate::agentdesk::protocol::{extract_json_object, get_ci, truncate_with_ellipsis};

/// Compressed outcome of a completed discussion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub struct KnowledgeBrief {
    pub summary: String,
    pub key_arguments: Vec<String>,
    pub consensus_points: Vec<String>,
    pub dissenting_views: Vec<String>,
    pub recommendations: Vec<String>,
}

fn string_list(obj: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    get_ci(obj, key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Decode a brief from the head's reply. Missing list keys default to empty;
/// a missing summary falls back to the truncated synthesis. Returns `None`
/// only when no JSON object could be found at all.
pub fn parse_brief(reply: &str, synthesis: &str) -> Option<KnowledgeBrief> {
    let raw = extract_json_object(reply)?;
    let value: Value = serde_json::from_str(raw).ok()?;
    let obj = value.as_object()?;

    let summary = get_ci(obj, "summary")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| truncate_with_ellipsis(synthesis, 500));

    Some(KnowledgeBrief {
        summary,
        key_arguments: string_list(obj, "keyArguments"),
        consensus_points: string_list(obj, "consensusPoints"),
        dissenting_views: string_list(obj, "dissentingViews"),
        recommendations: string_list(obj, "recommendations"),
    })
}

/// Deterministic brief used when the head replies with prose or fails:
/// the truncated synthesis plus the first five panelist one-liners.
pub fn fallback_brief(synthesis: &str, transcript: &[PanelMessage]) -> KnowledgeBrief {
    let key_arguments = transcript
        .iter()
        .filter(|m| m.message_type == MessageType::PanelistArgument)
        .take(5)
        .map(|m| {
            let first_line = m.content.lines().next().unwrap_or("").trim();
            format!("{}: {}", m.author_name, truncate_with_ellipsis(first_line, 120))
        })
        .collect();

    KnowledgeBrief {
        summary: truncate_with_ellipsis(synthesis, 500),
        key_arguments,
        consensus_points: Vec::new(),
        dissenting_views: Vec::new(),
        recommendations: Vec::new(),
    }
}

/// Ask the head for a brief in an ephemeral session.
///
/// The session is created for this one call and terminated on every path;
/// failures degrade to [`fallback_brief`], never to an error.
pub async fn generate_brief(
    client: Arc<dyn ChatClient>,
    synthesis: &str,
    transcript: &[PanelMessage],
) -> KnowledgeBrief {
    let session_id = format!("head-brief-{}", short_id());
    let prompt = format!(
        "Compress the following panel report into JSON with keys \
         {{\"summary\": string, \"keyArguments\": [string], \
         \"consensusPoints\": [string], \"dissentingViews\": [string], \
         \"recommendations\": [string]}}. Reply with ONLY the JSON object.\n\n\
         Report:\n{}",
        synthesis
    );

    let reply = client.send_blocking(&session_id, &prompt).await;
    if let Err(err) = client.terminate_session(&session_id).await {
        log::warn!("failed to terminate brief session '{}': {}", session_id, err);
    }

    match reply {
        Ok(message) => parse_brief(&message.content, synthesis)
            .unwrap_or_else(|| fallback_brief(synthesis, transcript)),
        Err(err) => {
            log::warn!("brief generation failed, using fallback: {}", err);
            fallback_brief(synthesis, transcript)
        }
    }
}

/// Answer a follow-up question using the brief as context, in an ephemeral
/// head session.
pub async fn answer_follow_up(
    client: Arc<dyn ChatClient>,
    brief: &KnowledgeBrief,
    question: &str,
) -> OrchestratorResult<String> {
    let session_id = format!("head-followup-{}", short_id());
    let prompt = format!(
        "You led a panel discussion that concluded with this brief.\n\n\
         Summary: {summary}\n\
         Key arguments:\n{key_args}\n\
         Consensus:\n{consensus}\n\
         Dissent:\n{dissent}\n\
         Recommendations:\n{recs}\n\n\
         Answer the user's follow-up question from the brief alone.\n\
         Question: {question}",
        summary = brief.summary,
        key_args = bullet_list(&brief.key_arguments),
        consensus = bullet_list(&brief.consensus_points),
        dissent = bullet_list(&brief.dissenting_views),
        recs = bullet_list(&brief.recommendations),
        question = question,
    );

    let reply = client.send_blocking(&session_id, &prompt).await;
    if let Err(err) = client.terminate_session(&session_id).await {
        log::warn!("failed to terminate follow-up session '{}': {}", session_id, err);
    }
    reply.map(|message| message.content)
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentdesk::agent::AgentRole;
    use chrono::Utc;

    fn argument(author: &str, content: &str) -> PanelMessage {
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
    fn parses_a_complete_brief() {
        let reply = r#"{"summary": "We should do X.",
            "keyArguments": ["a", "b"], "consensusPoints": ["c"],
            "dissentingViews": [], "recommendations": ["do X"]}"#;
        let brief = parse_brief(reply, "synthesis").unwrap();
        assert_eq!(brief.summary, "We should do X.");
        assert_eq!(brief.key_arguments, vec!["a", "b"]);
        assert_eq!(brief.recommendations, vec!["do X"]);
        assert!(brief.dissenting_views.is_empty());
    }

    #[test]
    fn missing_keys_default_to_empty() {
        let brief = parse_brief(r#"{"summary": "short"}"#, "synthesis").unwrap();
        assert!(brief.key_arguments.is_empty());
        assert!(brief.consensus_points.is_empty());
    }

    #[test]
    fn missing_summary_uses_synthesis() {
        let brief = parse_brief(r#"{"keyArguments": ["a"]}"#, "the synthesis text").unwrap();
        assert_eq!(brief.summary, "the synthesis text");
    }

    #[test]
    fn prose_reply_yields_no_brief() {
        assert!(parse_brief("I would summarize it as follows.", "synthesis").is_none());
    }

    #[test]
    fn fallback_takes_first_five_one_liners() {
        let transcript: Vec<PanelMessage> = (0..7)
            .map(|i| argument(&format!("P{}", i), &format!("Point {}\nmore detail", i)))
            .collect();
        let brief = fallback_brief("syn", &transcript);
        assert_eq!(brief.summary, "syn");
        assert_eq!(brief.key_arguments.len(), 5);
        assert_eq!(brief.key_arguments[0], "P0: Point 0");
        assert!(brief.consensus_points.is_empty());
    }
}
