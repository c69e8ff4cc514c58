//! Provider-agnostic adapter over the external chat service.
//!
//! Applications interact with the runtime through the [`ChatClient`] trait and
//! the lightweight data types defined in this module. The trait abstracts over
//! the concrete transport (SDK, HTTP, spawned CLI) while the supporting structs
//! describe chat messages, streaming chunks, token accounting, and the tool
//! event channel consumed by trace collectors.
//!
//! # Streaming contract
//!
//! [`ChatClient::send_streaming`] yields chunks whose `content` is
//! **cumulative**, not incremental: every chunk carries the full response text
//! produced so far, and the final chunk carries the complete response. Consumers
//! that need deltas track the previously seen length and take the new suffix;
//! [`DeltaTracker`] implements exactly that and is the one sanctioned way to do
//! it. Cancelling the consuming task aborts the stream and no further chunks
//! are yielded.
//!
//! # Session identity
//!
//! Session ids are caller-assigned strings. An implementation must route tool
//! events solely by that id so that two concurrent sessions never observe each
//! other's traffic. Sending to a previously unseen id implicitly opens the
//! session; [`ChatClient::terminate_session`] closes it. The orchestrators in
//! this crate guarantee one termination per opened session on every exit path.

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::pin::Pin;
use tokio::sync::broadcast;

use crate::agentdesk::error::OrchestratorResult;

/// Roles a chat message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    /// System priming content that constrains assistant behaviour.
    System,
    /// A user-authored message.
    User,
    /// A model-authored message.
    Assistant,
}

/// Token accounting reported by the provider for a single round-trip.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Generated/output tokens billed by the provider.
    pub output_tokens: usize,
}

impl TokenUsage {
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// A complete chat message returned by [`ChatClient::send_blocking`].
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Usage for the round-trip that produced this message, when the provider
    /// reports it.
    pub usage: Option<TokenUsage>,
}

/// One element of a streaming response.
///
/// `content` is cumulative; see the module docs for the delta contract.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content: String,
    /// Provider completion status (e.g. `"stop"`), present on the final chunk.
    pub finish_reason: Option<String>,
}

/// Boxed stream of cumulative chunks compatible with `Send` executors.
pub type ChatStream = Pin<Box<dyn Stream<Item = OrchestratorResult<StreamChunk>> + Send>>;

/// A tool or reasoning event observed on a session.
///
/// Events are a tagged sum at the adapter boundary. Adapter-private payload
/// types never cross this seam; trace collectors and UIs consume only this
/// shape.
#[derive(Debug, Clone)]
pub struct ToolEvent {
    /// The caller-assigned session the event belongs to.
    pub session_id: String,
    pub kind: ToolEventKind,
}

/// The kinds of events the adapter reports while a session is generating.
#[derive(Debug, Clone)]
pub enum ToolEventKind {
    /// Incremental reasoning text, forwarded verbatim.
    ReasoningDelta { text: String },
    /// A tool invocation started.
    ToolStart { tool_call_id: String, name: String },
    /// A previously started tool invocation finished.
    ToolComplete { tool_call_id: String },
}

/// Uniform send/stream interface over the external chat service.
///
/// Implementations must be thread-safe (`Send + Sync`) so a single client can
/// be shared between the office loop, the panel loop, and every assistant
/// worker. Failure modes: transport errors surface as
/// [`OrchestratorError::Transport`](crate::agentdesk::error::OrchestratorError);
/// an unknown model id fails fast on the first send; timeouts are imposed by
/// callers through cancellation, not by the adapter.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a prompt and wait for the complete response.
    async fn send_blocking(&self, session_id: &str, prompt: &str)
        -> OrchestratorResult<ChatMessage>;

    /// Send a prompt and obtain a stream of cumulative chunks.
    ///
    /// The final yielded value is the complete response with trailing
    /// whitespace trimmed. A transport failure surfaces as a single failing
    /// terminal item.
    async fn send_streaming(&self, session_id: &str, prompt: &str)
        -> OrchestratorResult<ChatStream>;

    /// Close a session and free any provider-side resources tied to it.
    async fn terminate_session(&self, session_id: &str) -> OrchestratorResult<()>;

    /// List the model identifiers this client can serve.
    async fn list_models(&self) -> OrchestratorResult<Vec<String>>;

    /// Subscribe to the tool/reasoning event channel.
    ///
    /// Every subscriber receives events for all sessions and filters by
    /// [`ToolEvent::session_id`]; the adapter guarantees per-producer ordering
    /// on each receiver.
    fn tool_events(&self) -> broadcast::Receiver<ToolEvent>;
}

/// Tracks how much of a cumulative stream has been seen and extracts deltas.
///
/// # Example
///
/// ```
/// use agentdesk::DeltaTracker;
///
/// let mut tracker = DeltaTracker::new();
/// assert_eq!(tracker.delta("Hel"), "Hel");
/// assert_eq!(tracker.delta("Hello"), "lo");
/// assert_eq!(tracker.delta("Hello"), "");
/// ```
#[derive(Debug, Default)]
pub struct DeltaTracker {
    seen: usize,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self { seen: 0 }
    }

    /// Return the suffix of `cumulative` that has not been returned before.
    ///
    /// A chunk shorter than the previously seen content yields an empty delta
    /// rather than panicking; providers occasionally resend earlier snapshots
    /// after a reconnect.
    pub fn delta<'a>(&mut self, cumulative: &'a str) -> &'a str {
        if cumulative.len() <= self.seen {
            return "";
        }
        // Walk back to a char boundary in case the snapshot grew mid-codepoint.
        let mut start = self.seen;
        while start < cumulative.len() && !cumulative.is_char_boundary(start) {
            start -= 1;
        }
        self.seen = cumulative.len();
        &cumulative[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_tracker_takes_suffixes() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.delta("a"), "a");
        assert_eq!(tracker.delta("abc"), "bc");
        assert_eq!(tracker.delta("abc"), "");
        assert_eq!(tracker.delta("abcdef"), "def");
    }

    #[test]
    fn delta_tracker_tolerates_shrinking_snapshots() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.delta("abcdef"), "abcdef");
        assert_eq!(tracker.delta("abc"), "");
        assert_eq!(tracker.delta("abcdefgh"), "gh");
    }

    #[test]
    fn token_usage_totals() {
        let usage = TokenUsage { input_tokens: 10, output_tokens: 5 };
        assert_eq!(usage.total(), 15);
    }
}
