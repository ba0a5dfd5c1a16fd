//! Background Reply Pipeline
//!
//! Generates automated replies for one-to-one conversations with the
//! assistant identity. Runs detached from the triggering request: the
//! sender's write is acknowledged immediately and the reply arrives
//! later through the normal persist-and-broadcast path. The pipeline
//! never leaves a conversation silently unanswered — every guard trip
//! and failure category degrades to a canned, user-legible reply.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use shoal_protocol::{ConversationPreview, Message, ServerEvent};

use crate::rooms::RoomMultiplexer;
use crate::store::MessageStore;

/// Canned replies, selected by guard or coarse failure category. Raw
/// errors never reach the conversation.
pub const REPLY_TOO_LONG: &str =
    "That message is a bit too long for me. Could you shorten it and try again?";
pub const REPLY_DAILY_LIMIT: &str =
    "I've reached my reply limit for today in this chat. Let's pick this up tomorrow!";
pub const REPLY_UNAVAILABLE: &str =
    "I'm having trouble reaching my thoughts right now. Please try again in a moment.";
pub const REPLY_TOO_SLOW: &str = "That one took me too long to think about. Mind asking again?";
pub const REPLY_GENERIC_FAILURE: &str = "Something went wrong on my end. Please try again.";

/// Typed failure categories for the generation boundary. Classification
/// happens from the transport error surface, never from error text.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation timed out")]
    Timeout,
    #[error("generation backend unreachable")]
    Unreachable,
    #[error("malformed generation response")]
    Malformed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The text-generation boundary: one call, caller-bounded by a timeout.
/// Any provider satisfying this contract is substitutable.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError>;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

/// HTTP generation provider: POSTs `{"prompt": ...}` to
/// `<base_url>/generate` and expects `{"text": ...}` back.
pub struct HttpGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGenerator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build generation HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(classify_request_error)?;

        let response = response
            .error_for_status()
            .map_err(|e| GenerateError::Other(e.into()))?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|_| GenerateError::Malformed)?;
        Ok(body.text)
    }
}

fn classify_request_error(e: reqwest::Error) -> GenerateError {
    if e.is_timeout() {
        GenerateError::Timeout
    } else if e.is_connect() {
        GenerateError::Unreachable
    } else {
        GenerateError::Other(e.into())
    }
}

/// Pipeline tunables. Ceilings mirror the product limits: prompts over
/// `prompt_ceiling` chars skip generation, and each conversation gets at
/// most `daily_limit` automated replies per UTC calendar day.
#[derive(Clone)]
pub struct AssistantConfig {
    pub identity: String,
    pub prompt_ceiling: usize,
    pub daily_limit: u64,
    pub timeout: Duration,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            identity: "assistant".to_string(),
            prompt_ceiling: 1000,
            daily_limit: 20,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Terminal states of one pipeline run. Every variant except
/// `NotEligible` delivered a reply into the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Generated reply persisted and broadcast.
    Delivered,
    /// Length guard tripped; canned reply, no external call made.
    TooLong,
    /// Daily ceiling reached; canned reply, no external call made.
    RateLimited,
    /// Generation exceeded its bound; canned reply.
    TimedOut,
    /// Generation failed; canned reply by failure category.
    Errored,
    /// Trigger did not address the assistant identity.
    NotEligible,
}

/// Rate-limited, timeout-bounded automated reply injection.
pub struct ReplyPipeline {
    store: Arc<dyn MessageStore>,
    rooms: Arc<RoomMultiplexer>,
    generator: Arc<dyn Generator>,
    config: AssistantConfig,
}

impl ReplyPipeline {
    pub fn new(
        store: Arc<dyn MessageStore>,
        rooms: Arc<RoomMultiplexer>,
        generator: Arc<dyn Generator>,
        config: AssistantConfig,
    ) -> Self {
        Self {
            store,
            rooms,
            generator,
            config,
        }
    }

    /// Fire-and-forget trigger from the durable write path. The caller's
    /// request is never blocked; overlapping triggers into the same
    /// conversation run independently and may both reply.
    pub fn trigger(self: &Arc<Self>, incoming: &Message, peer_id: &str) {
        let pipeline = Arc::clone(self);
        let incoming = incoming.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let conversation_id = incoming.conversation_id.clone();
            match pipeline.run(&incoming, &peer_id).await {
                Ok(outcome) => {
                    info!(conversation = %conversation_id, ?outcome, "assistant pipeline finished")
                }
                Err(e) => {
                    warn!(conversation = %conversation_id, "assistant pipeline failed: {:#}", e)
                }
            }
        });
    }

    /// One full pipeline run: eligibility, guards, bounded generation,
    /// delivery. Awaitable directly for tests.
    pub async fn run(&self, incoming: &Message, peer_id: &str) -> Result<ReplyOutcome> {
        if peer_id != self.config.identity || incoming.sender_id == self.config.identity {
            return Ok(ReplyOutcome::NotEligible);
        }
        let prompt = incoming.text.as_deref().unwrap_or_default();

        if prompt.chars().count() > self.config.prompt_ceiling {
            self.deliver(&incoming.conversation_id, REPLY_TOO_LONG)
                .await?;
            return Ok(ReplyOutcome::TooLong);
        }

        if self.replies_today(&incoming.conversation_id).await? >= self.config.daily_limit {
            self.deliver(&incoming.conversation_id, REPLY_DAILY_LIMIT)
                .await?;
            return Ok(ReplyOutcome::RateLimited);
        }

        let generated =
            tokio::time::timeout(self.config.timeout, self.generator.generate(prompt)).await;

        let (text, outcome) = match generated {
            Ok(Ok(reply)) => (reply, ReplyOutcome::Delivered),
            Ok(Err(GenerateError::Timeout)) | Err(_) => {
                (REPLY_TOO_SLOW.to_string(), ReplyOutcome::TimedOut)
            }
            Ok(Err(GenerateError::Unreachable)) => {
                (REPLY_UNAVAILABLE.to_string(), ReplyOutcome::Errored)
            }
            Ok(Err(e @ (GenerateError::Malformed | GenerateError::Other(_)))) => {
                warn!(conversation = %incoming.conversation_id, "generation failed: {}", e);
                (REPLY_GENERIC_FAILURE.to_string(), ReplyOutcome::Errored)
            }
        };

        self.deliver(&incoming.conversation_id, &text).await?;
        Ok(outcome)
    }

    /// Automated replies already persisted today in this conversation.
    /// Recomputed from the store on every trigger rather than cached.
    async fn replies_today(&self, conversation_id: &str) -> Result<u64> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .context("invalid midnight")?
            .and_utc();
        self.store
            .count_messages_from_sender_since(conversation_id, &self.config.identity, midnight)
            .await
    }

    /// Persist the reply, refresh the preview, and broadcast it into the
    /// conversation room exactly like a normal message.
    async fn deliver(&self, conversation_id: &str, text: &str) -> Result<()> {
        let reply = Message::new(conversation_id, &self.config.identity, text);
        self.store.insert_message(&reply).await?;
        self.store
            .upsert_preview(&ConversationPreview::from_message(&reply))
            .await?;
        self.rooms
            .broadcast_to_room(
                conversation_id,
                ServerEvent::MessageNew {
                    conversation_id: conversation_id.to_string(),
                    message: reply,
                },
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FixedGenerator {
        calls: AtomicUsize,
        reply: &'static str,
    }

    #[async_trait]
    impl Generator for FixedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.to_string())
        }
    }

    struct StallingGenerator;

    #[async_trait]
    impl Generator for StallingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    struct FailingGenerator {
        error: fn() -> GenerateError,
    }

    #[async_trait]
    impl Generator for FailingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
            Err((self.error)())
        }
    }

    struct Harness {
        pipeline: ReplyPipeline,
        store: Arc<MemoryStore>,
        rooms: Arc<RoomMultiplexer>,
    }

    fn harness(generator: Arc<dyn Generator>, config: AssistantConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let rooms = Arc::new(RoomMultiplexer::new());
        let pipeline = ReplyPipeline::new(store.clone(), rooms.clone(), generator, config);
        Harness {
            pipeline,
            store,
            rooms,
        }
    }

    async fn watch_room(h: &Harness, conv: &str) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(16);
        h.rooms.register_connection("conn-peer", "u-1", tx).await;
        h.rooms.join("conn-peer", conv).await;
        rx
    }

    fn user_msg(text: &str) -> Message {
        Message::new("conv-1", "u-1", text)
    }

    #[tokio::test]
    async fn generated_reply_is_persisted_and_broadcast() {
        let generator = Arc::new(FixedGenerator {
            calls: AtomicUsize::new(0),
            reply: "hello back",
        });
        let h = harness(generator.clone(), AssistantConfig::default());
        let mut rx = watch_room(&h, "conv-1").await;

        let outcome = h.pipeline.run(&user_msg("hi"), "assistant").await.unwrap();
        assert_eq!(outcome, ReplyOutcome::Delivered);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

        let msgs = h.store.list_messages("conv-1").await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].sender_id, "assistant");
        assert_eq!(msgs[0].text.as_deref(), Some("hello back"));

        match rx.recv().await.unwrap() {
            ServerEvent::MessageNew { message, .. } => {
                assert_eq!(message.text.as_deref(), Some("hello back"))
            }
            _ => panic!("Expected MessageNew"),
        }

        let preview = h.store.get_preview("conv-1").await.unwrap().unwrap();
        assert_eq!(preview.last_sender_id.as_deref(), Some("assistant"));
    }

    #[tokio::test]
    async fn oversized_prompt_gets_canned_reply_without_generation() {
        // Scenario: 1500-char prompt against a 1000-char ceiling.
        let generator = Arc::new(FixedGenerator {
            calls: AtomicUsize::new(0),
            reply: "should not be called",
        });
        let h = harness(generator.clone(), AssistantConfig::default());
        let mut rx = watch_room(&h, "conv-1").await;

        let long = "x".repeat(1500);
        let outcome = h
            .pipeline
            .run(&user_msg(&long), "assistant")
            .await
            .unwrap();
        assert_eq!(outcome, ReplyOutcome::TooLong);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

        match rx.recv().await.unwrap() {
            ServerEvent::MessageNew { message, .. } => {
                assert_eq!(message.text.as_deref(), Some(REPLY_TOO_LONG))
            }
            _ => panic!("Expected MessageNew"),
        }
    }

    #[tokio::test]
    async fn daily_ceiling_trips_rate_guard() {
        // Scenario: 20 automated replies already today; the 21st trigger
        // gets the canned limit reply and no generation call.
        let generator = Arc::new(FixedGenerator {
            calls: AtomicUsize::new(0),
            reply: "should not be called",
        });
        let h = harness(generator.clone(), AssistantConfig::default());

        for i in 0..20 {
            h.store
                .insert_message(&Message::new("conv-1", "assistant", &format!("r{}", i)))
                .await
                .unwrap();
        }

        let outcome = h
            .pipeline
            .run(&user_msg("one more?"), "assistant")
            .await
            .unwrap();
        assert_eq!(outcome, ReplyOutcome::RateLimited);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

        let msgs = h.store.list_messages("conv-1").await.unwrap();
        assert_eq!(msgs.last().unwrap().text.as_deref(), Some(REPLY_DAILY_LIMIT));
    }

    #[tokio::test]
    async fn rate_guard_counts_only_this_conversation() {
        let generator = Arc::new(FixedGenerator {
            calls: AtomicUsize::new(0),
            reply: "fresh conversation",
        });
        let h = harness(generator.clone(), AssistantConfig::default());

        for i in 0..20 {
            h.store
                .insert_message(&Message::new("conv-other", "assistant", &format!("r{}", i)))
                .await
                .unwrap();
        }

        let outcome = h.pipeline.run(&user_msg("hi"), "assistant").await.unwrap();
        assert_eq!(outcome, ReplyOutcome::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_generation_times_out_with_fallback() {
        // Scenario: generation exceeds its bound; the too-slow canned
        // reply lands within one timeout interval.
        let h = harness(Arc::new(StallingGenerator), AssistantConfig::default());

        let outcome = h.pipeline.run(&user_msg("hi"), "assistant").await.unwrap();
        assert_eq!(outcome, ReplyOutcome::TimedOut);

        let msgs = h.store.list_messages("conv-1").await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text.as_deref(), Some(REPLY_TOO_SLOW));
    }

    #[tokio::test]
    async fn unreachable_backend_gets_unavailable_reply() {
        let h = harness(
            Arc::new(FailingGenerator {
                error: || GenerateError::Unreachable,
            }),
            AssistantConfig::default(),
        );
        let outcome = h.pipeline.run(&user_msg("hi"), "assistant").await.unwrap();
        assert_eq!(outcome, ReplyOutcome::Errored);

        let msgs = h.store.list_messages("conv-1").await.unwrap();
        assert_eq!(msgs[0].text.as_deref(), Some(REPLY_UNAVAILABLE));
    }

    #[tokio::test]
    async fn malformed_response_gets_generic_reply() {
        let h = harness(
            Arc::new(FailingGenerator {
                error: || GenerateError::Malformed,
            }),
            AssistantConfig::default(),
        );
        let outcome = h.pipeline.run(&user_msg("hi"), "assistant").await.unwrap();
        assert_eq!(outcome, ReplyOutcome::Errored);

        let msgs = h.store.list_messages("conv-1").await.unwrap();
        assert_eq!(msgs[0].text.as_deref(), Some(REPLY_GENERIC_FAILURE));
    }

    #[tokio::test]
    async fn non_assistant_peer_is_not_eligible() {
        let generator = Arc::new(FixedGenerator {
            calls: AtomicUsize::new(0),
            reply: "nope",
        });
        let h = harness(generator.clone(), AssistantConfig::default());

        let outcome = h.pipeline.run(&user_msg("hi"), "u-2").await.unwrap();
        assert_eq!(outcome, ReplyOutcome::NotEligible);
        assert!(h.store.list_messages("conv-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn assistant_own_echo_does_not_retrigger() {
        let generator = Arc::new(FixedGenerator {
            calls: AtomicUsize::new(0),
            reply: "loop",
        });
        let h = harness(generator.clone(), AssistantConfig::default());

        let own = Message::new("conv-1", "assistant", "previous reply");
        let outcome = h.pipeline.run(&own, "assistant").await.unwrap();
        assert_eq!(outcome, ReplyOutcome::NotEligible);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_ceiling_holds_across_sequential_triggers() {
        let generator = Arc::new(FixedGenerator {
            calls: AtomicUsize::new(0),
            reply: "ok",
        });
        let h = harness(generator.clone(), AssistantConfig::default());

        for i in 0..25 {
            h.pipeline
                .run(&user_msg(&format!("msg {}", i)), "assistant")
                .await
                .unwrap();
        }

        // 20 generated replies plus canned limit replies after that; the
        // generator itself was only invoked up to the ceiling.
        assert_eq!(generator.calls.load(Ordering::SeqCst), 20);
    }
}
