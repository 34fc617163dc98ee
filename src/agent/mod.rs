//! Agent loop: the per-inbound-message state machine between the bus
//! and the provider chain.
//!
//! For each inbound message: load the session, build the provider
//! message list, optionally route the model, then alternate provider
//! calls and tool executions until the model finishes or the iteration
//! ceiling is hit. The session is persisted on clean loop exit or on an
//! explicit error turn — a round interrupted by cancellation is
//! discarded, never half-persisted. Summarization runs asynchronously
//! once history exceeds its budget.

pub mod context;
pub mod file_refs;
pub mod memory;
pub mod router;

pub use context::ContextBuilder;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::config::Config;
use crate::providers::fallback::FallbackChain;
use crate::providers::{ChatOptions, Message, ProviderError};
use crate::session::{Session, SessionStore};
use crate::tools::spawn::SubagentRunner;
use crate::tools::ToolRegistry;

/// Concurrent inbound messages serviced at once. Per-session ordering is
/// still enforced by the session lock.
const WORKER_PERMITS: usize = 4;

/// Loop states, visible for logging and tests. Terminal = Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Building,
    Calling,
    Executing,
    Summarizing,
    Done,
}

pub struct AgentLoop {
    workspace: PathBuf,
    bus: Arc<MessageBus>,
    chain: Arc<FallbackChain>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    context: Arc<ContextBuilder>,
    config: Config,
    permits: Arc<Semaphore>,
}

impl AgentLoop {
    pub fn new(
        config: Config,
        bus: Arc<MessageBus>,
        chain: Arc<FallbackChain>,
        registry: Arc<ToolRegistry>,
        context: Arc<ContextBuilder>,
    ) -> Self {
        let workspace = PathBuf::from(&config.agent.workspace);
        Self {
            sessions: Arc::new(SessionStore::new(&workspace)),
            workspace,
            bus,
            chain,
            registry,
            context,
            config,
            permits: Arc::new(Semaphore::new(WORKER_PERMITS)),
        }
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    /// Consume inbound messages until cancelled, dispatching each to a
    /// bounded worker.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(workspace = %self.workspace.display(), "agent loop started");

        while let Some(msg) = self.bus.consume_inbound(&cancel).await {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let _permit = permit;
                this.handle_inbound(msg, cancel).await;
            });
        }

        info!("agent loop stopped");
    }

    /// Service one inbound message end to end: serialize on the session
    /// key, bound total wall time, emit exactly one outbound message on
    /// terminal errors.
    pub async fn handle_inbound(&self, msg: InboundMessage, cancel: CancellationToken) {
        let session_lock = self.sessions.lock_for(&msg.session_key);
        let _guard = session_lock.lock().await;

        let deadline = Duration::from_secs(self.config.agent.request_timeout_secs);
        let result = tokio::time::timeout(deadline, self.run_loop(&msg, &cancel)).await;

        let reply = match result {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => return, // nothing to answer (empty payload)
            Ok(Err(e)) => {
                error!(
                    channel = %msg.channel,
                    session = %msg.session_key,
                    error = %e,
                    "agent turn failed"
                );
                user_facing_error(&e)
            }
            Err(_) => {
                error!(
                    channel = %msg.channel,
                    session = %msg.session_key,
                    timeout_secs = deadline.as_secs(),
                    "agent turn exceeded request deadline"
                );
                "That took longer than the time budget allows — please try again.".to_string()
            }
        };

        if let Err(e) = self
            .bus
            .publish_outbound(OutboundMessage {
                channel: msg.channel.clone(),
                chat_id: msg.chat_id.clone(),
                content: reply,
            })
            .await
        {
            error!(channel = %msg.channel, error = %e, "failed to publish outbound reply");
        }
    }

    /// The loop proper. Returns `Ok(None)` when the inbound carried
    /// nothing worth answering.
    async fn run_loop(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<String>> {
        let mut state = LoopState::Idle;
        debug!(session = %msg.session_key, ?state, "turn accepted");

        state = LoopState::Building;
        debug!(session = %msg.session_key, ?state, "building context");

        let mut session = self.sessions.load(&msg.session_key).await?;

        let messages = self
            .context
            .build_messages(
                &session.messages,
                &session.summary,
                &msg.content,
                &msg.encoded_images,
                &msg.attachments,
                &msg.attachment_errors,
                &msg.file_refs,
                &msg.channel,
                &msg.chat_id,
            )
            .await;

        // The builder suppresses empty user messages; if none was
        // appended there is nothing to answer.
        if messages.last().map(|m| m.role.as_str()) != Some("user") {
            debug!(session = %msg.session_key, "empty inbound, nothing to process");
            return Ok(None);
        }
        let mut messages = messages;

        // History record: composed text + ref metadata, never payloads.
        let mut user_record = Message::new("user", messages.last().unwrap().content.clone());
        user_record.file_refs = file_refs::to_file_ref_meta(&msg.file_refs);
        session.messages.push(user_record);

        let model_override =
            router::route_model(&self.chain, &msg.content, &self.config.model_routing).await;

        let opts = ChatOptions {
            prompt_cache_key: Some(msg.session_key.clone()),
            ..Default::default()
        };
        let tools = self.registry.definitions();
        let tool_timeout = Duration::from_secs(self.config.tools.exec.timeout_secs);

        let max_iterations = self.config.agent.max_iterations;
        for iteration in 0..=max_iterations {
            state = LoopState::Calling;
            debug!(session = %msg.session_key, iteration, ?state, "provider call");

            let response = match self
                .chain
                .chat(&messages, &tools, model_override.as_deref(), &opts)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    // Persist up to the last consistent turn before
                    // surfacing.
                    let _ = self.sessions.save(&msg.session_key, &session).await;
                    return Err(e.into());
                }
            };

            if response.tool_calls.is_empty() || iteration == max_iterations {
                let reply = if !response.content.is_empty() {
                    response.content.clone()
                } else {
                    "[tool iteration limit reached]".to_string()
                };

                let mut assistant = Message::new("assistant", response.content);
                assistant.reasoning_content = response.reasoning_content;
                session.messages.push(assistant);
                self.sessions.save(&msg.session_key, &session).await?;

                state = LoopState::Done;
                debug!(session = %msg.session_key, iteration, ?state, "turn finished");
                self.summarize_in_background(&msg.session_key);
                return Ok(Some(reply));
            }

            state = LoopState::Executing;
            debug!(
                session = %msg.session_key,
                iteration,
                calls = response.tool_calls.len(),
                ?state,
                "executing tool calls"
            );

            // Collect the whole round before committing it: on
            // cancellation the partial results are discarded, leaving
            // the session at its last consistent turn.
            let mut assistant = Message::new("assistant", response.content.clone());
            assistant.reasoning_content = response.reasoning_content.clone();
            assistant.tool_calls = response.tool_calls.clone();
            let mut round = vec![assistant];

            for call in &response.tool_calls {
                let result = self
                    .registry
                    .execute(&call.name, call.arguments.clone(), tool_timeout, cancel)
                    .await;
                if result.is_error {
                    warn!(tool = %call.name, "tool returned error result");
                }
                round.push(Message {
                    role: "tool".into(),
                    content: result.for_llm,
                    tool_call_id: call.id.clone(),
                    ..Default::default()
                });
            }

            if cancel.is_cancelled() {
                let _ = self.sessions.save(&msg.session_key, &session).await;
                anyhow::bail!("turn cancelled during tool execution");
            }

            for m in round {
                messages.push(m.clone());
                session.messages.push(m);
            }
        }

        unreachable!("loop exits via the iteration ceiling branch");
    }

    // -- summarization ------------------------------------------------------

    fn over_summary_budget(&self, session: &Session) -> bool {
        let turns = session.messages.len();
        let chars: usize = session.messages.iter().map(|m| m.content.len()).sum();
        turns > self.config.agent.summary_trigger_turns
            || chars > self.config.agent.summary_trigger_chars
    }

    /// Kick off summarization outside the request path when history
    /// exceeds its budget. Takes the session lock itself.
    fn summarize_in_background(&self, session_key: &str) {
        let sessions = self.sessions.clone();
        let chain = self.chain.clone();
        let key = session_key.to_string();
        let trigger_turns = self.config.agent.summary_trigger_turns;
        let trigger_chars = self.config.agent.summary_trigger_chars;

        tokio::spawn(async move {
            let lock = sessions.lock_for(&key);
            let _guard = lock.lock().await;

            let mut session = match sessions.load(&key).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(session = %key, error = %e, "summarize: load failed");
                    return;
                }
            };

            let turns = session.messages.len();
            let chars: usize = session.messages.iter().map(|m| m.content.len()).sum();
            if turns <= trigger_turns && chars <= trigger_chars {
                return;
            }

            let state = LoopState::Summarizing;
            debug!(session = %key, turns, chars, ?state, "summarizing session history");

            // Keep the newest half; summarize the rest together with
            // the previous summary.
            let split = turns / 2;
            let pruned: Vec<String> = session.messages[..split]
                .iter()
                .map(|m| format!("[{}]: {}", m.role, clip(&m.content, 500)))
                .collect();

            let mut prompt = String::from(
                "Summarize the following conversation history into a concise paragraph. \
                 Preserve key facts, decisions, file paths mentioned, and tool results. \
                 Omit greetings and filler.\n\n",
            );
            if !session.summary.is_empty() {
                prompt.push_str(&format!("Earlier summary:\n{}\n\n", session.summary));
            }
            prompt.push_str(&pruned.join("\n"));

            let summary_messages = vec![Message::new("user", prompt)];
            match chain
                .chat(&summary_messages, &[], None, &ChatOptions::default())
                .await
            {
                Ok(resp) if !resp.content.trim().is_empty() => {
                    session.summary = resp.content.trim().to_string();
                    session.messages.drain(..split);
                    if let Err(e) = sessions.save(&key, &session).await {
                        warn!(session = %key, error = %e, "summarize: save failed");
                    } else {
                        debug!(session = %key, kept = session.messages.len(), "history truncated after summarization");
                    }
                }
                Ok(_) => warn!(session = %key, "summarize: empty summary, keeping history"),
                Err(e) => warn!(session = %key, error = %e, "summarize: provider call failed"),
            }
        });
    }

    /// Synchronous check + summarize used by tests; production goes
    /// through [`summarize_in_background`].
    pub fn needs_summarization(&self, session: &Session) -> bool {
        self.over_summary_budget(session)
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let clipped: String = s.chars().take(max).collect();
    format!("{clipped}…[truncated]")
}

/// Map a terminal error to the single user-visible reply, never leaking
/// internals beyond the provider's own user-safe phrasing.
fn user_facing_error(e: &anyhow::Error) -> String {
    if let Some(pe) = e.downcast_ref::<ProviderError>() {
        return match pe {
            ProviderError::Fatal(_) => {
                "The language model rejected that request, so I can't answer it as sent."
                    .to_string()
            }
            ProviderError::Recoverable(_) => {
                "I couldn't reach a language model just now — please try again in a moment."
                    .to_string()
            }
        };
    }
    "A transient internal error interrupted that message. Please try again.".to_string()
}

// ---------------------------------------------------------------------------
// Subagent execution
// ---------------------------------------------------------------------------

/// Runs spawn-tool tasks in an isolated context: fresh history, shared
/// provider chain, and a registry without the spawn tool itself.
pub struct SubagentExecutor {
    pub chain: Arc<FallbackChain>,
    pub registry: Arc<ToolRegistry>,
    pub context: Arc<ContextBuilder>,
    pub max_iterations: usize,
    pub tool_timeout: Duration,
}

#[async_trait::async_trait]
impl SubagentRunner for SubagentExecutor {
    async fn run(&self, task: &str) -> anyhow::Result<String> {
        let mut messages = self
            .context
            .build_messages(&[], "", task, &[], &[], &[], &[], "", "")
            .await;
        let tools = self.registry.definitions();
        let opts = ChatOptions::default();
        let cancel = CancellationToken::new();

        for iteration in 0..=self.max_iterations {
            let response = self.chain.chat(&messages, &tools, None, &opts).await?;

            if response.tool_calls.is_empty() || iteration == self.max_iterations {
                return Ok(response.content);
            }

            let mut assistant = Message::new("assistant", response.content);
            assistant.tool_calls = response.tool_calls.clone();
            messages.push(assistant);

            for call in &response.tool_calls {
                let result = self
                    .registry
                    .execute(&call.name, call.arguments.clone(), self.tool_timeout, &cancel)
                    .await;
                messages.push(Message {
                    role: "tool".into(),
                    content: result.for_llm,
                    tool_call_id: call.id.clone(),
                    ..Default::default()
                });
            }
        }

        unreachable!("loop exits via the iteration ceiling branch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn loop_with_budget(turns: usize, chars: usize) -> AgentLoop {
        let config = Config {
            agent: AgentConfig {
                workspace: "/tmp/scuttle-test-ws".into(),
                summary_trigger_turns: turns,
                summary_trigger_chars: chars,
                ..Default::default()
            },
            ..Default::default()
        };
        AgentLoop::new(
            config,
            Arc::new(MessageBus::new()),
            Arc::new(FallbackChain::new(vec![])),
            Arc::new(ToolRegistry::new()),
            Arc::new(ContextBuilder::new("/tmp/scuttle-test-ws")),
        )
    }

    #[test]
    fn summary_budget_checks_turns_and_chars() {
        let al = loop_with_budget(4, 1000);

        let mut session = Session::default();
        for _ in 0..4 {
            session.messages.push(Message::new("user", "short"));
        }
        assert!(!al.needs_summarization(&session));

        session.messages.push(Message::new("assistant", "tips it"));
        assert!(al.needs_summarization(&session));

        let mut big = Session::default();
        big.messages.push(Message::new("user", "x".repeat(2000)));
        assert!(al.needs_summarization(&big));
    }

    #[test]
    fn clip_truncates_on_char_boundary() {
        assert_eq!(clip("short", 10), "short");
        let clipped = clip(&"é".repeat(20), 5);
        assert!(clipped.starts_with("ééééé"));
        assert!(clipped.ends_with("[truncated]"));
    }

    #[test]
    fn user_facing_errors_by_class() {
        let fatal: anyhow::Error = ProviderError::Fatal("401".into()).into();
        assert!(user_facing_error(&fatal).contains("rejected"));

        let recoverable: anyhow::Error = ProviderError::Recoverable("503".into()).into();
        assert!(user_facing_error(&recoverable).contains("try again"));

        let internal = anyhow::anyhow!("disk exploded");
        let text = user_facing_error(&internal);
        assert!(text.contains("transient internal error"));
        assert!(!text.contains("disk exploded"));
    }
}
