//! Channel base behavior: allow-list admission, inbound de-duplication,
//! group trigger rules, media-scope minting, and uniform ingress onto the
//! message bus.
//!
//! Concrete channels hold a [`BaseChannel`] by composition and forward
//! their platform events into [`BaseChannel::handle_message`] (or the
//! file-ref variant). Behavioral opt-ins — typing indicators, reactions,
//! placeholder replies — are separate traits the concrete channel may
//! implement and register on the base.

pub mod media;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::attachments::Processor;
use crate::bus::{
    AttachmentError, FileRef, InboundMessage, MessageBus, OutboundMessage, Peer, PeerKind,
    SenderInfo,
};
use crate::config::GroupTriggerConfig;
use crate::identity;

/// Number of cached message IDs that triggers a lazy cleanup pass.
const DEDUPE_CLEAN_THRESHOLD: i64 = 500;

/// How long a message ID is kept in the dedup cache.
const DEDUPE_EXPIRY: Duration = Duration::from_secs(10 * 60);

static UNIQUE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One-time random prefix so ids from different processes never collide.
static UNIQUE_ID_PREFIX: Lazy<String> = Lazy::new(|| {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    b.iter().map(|byte| format!("{byte:02x}")).collect()
});

/// Process-unique ID: random prefix + atomic counter.
///
/// Intended for internal correlation (media scope keys); NOT
/// cryptographically secure.
fn unique_id() -> String {
    let n = UNIQUE_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{}{n:x}", *UNIQUE_ID_PREFIX)
}

/// Build a scope key tying temp media files and side effects to their
/// originating inbound message.
pub fn build_media_scope(channel: &str, chat_id: &str, message_id: &str) -> String {
    let id = if message_id.is_empty() {
        unique_id()
    } else {
        message_id.to_string()
    };
    format!("{channel}:{chat_id}:{id}")
}

// ---------------------------------------------------------------------------
// Channel trait + capability opt-ins
// ---------------------------------------------------------------------------

/// A chat surface connected to the bus.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn send(&self, msg: OutboundMessage) -> anyhow::Result<()>;
    fn is_running(&self) -> bool;
}

/// Opt-in: channels that can advertise a maximum outbound message length
/// (in runes). The host splits longer replies. Zero means no limit.
pub trait MessageLengthProvider {
    fn max_message_length(&self) -> usize;
}

/// Undo handle returned by a capability invocation (stop typing, remove
/// reaction).
pub type UndoFn = Box<dyn FnOnce() + Send>;

/// Opt-in: start a typing indicator for a chat; returns a stop handle.
#[async_trait]
pub trait TypingCapable: Send + Sync {
    async fn start_typing(&self, chat_id: &str) -> anyhow::Result<UndoFn>;
}

/// Opt-in: react to the original message; returns an un-react handle.
#[async_trait]
pub trait ReactionCapable: Send + Sync {
    async fn react_to_message(&self, chat_id: &str, message_id: &str) -> anyhow::Result<UndoFn>;
}

/// Opt-in: pre-post a placeholder reply; returns the placeholder id.
#[async_trait]
pub trait PlaceholderCapable: Send + Sync {
    async fn send_placeholder(&self, chat_id: &str) -> anyhow::Result<String>;
}

/// Sink recording capability side effects so the reply path can undo or
/// replace them.
pub trait PlaceholderRecorder: Send + Sync {
    fn record_typing_stop(&self, channel: &str, chat_id: &str, stop: UndoFn);
    fn record_reaction_undo(&self, channel: &str, chat_id: &str, undo: UndoFn);
    fn record_placeholder(&self, channel: &str, chat_id: &str, placeholder_id: String);
}

/// Capability hooks the concrete channel registers on its base. Each is
/// independent; all may fire for the same message.
#[derive(Default)]
pub struct ChannelCapabilities {
    pub typing: Option<Arc<dyn TypingCapable>>,
    pub reaction: Option<Arc<dyn ReactionCapable>>,
    pub placeholder: Option<Arc<dyn PlaceholderCapable>>,
}

/// Resolves `media://` refs into local filesystem paths.
pub trait MediaStore: Send + Sync {
    fn resolve(&self, reference: &str) -> anyhow::Result<String>;
}

// ---------------------------------------------------------------------------
// BaseChannel
// ---------------------------------------------------------------------------

/// Shared inbound normalization held by every concrete channel.
pub struct BaseChannel {
    name: String,
    bus: Arc<MessageBus>,
    allow_list: Vec<String>,
    group_trigger: GroupTriggerConfig,
    max_message_length: usize,
    processor: Processor,
    media_store: Option<Arc<dyn MediaStore>>,
    capabilities: ChannelCapabilities,
    placeholder_recorder: Option<Arc<dyn PlaceholderRecorder>>,
    recent_msg_ids: DashMap<String, Instant>,
    dedupe_count: AtomicI64,
    running: std::sync::atomic::AtomicBool,
}

impl BaseChannel {
    pub fn new(name: impl Into<String>, bus: Arc<MessageBus>, allow_list: Vec<String>) -> Self {
        Self {
            name: name.into(),
            bus,
            allow_list,
            group_trigger: GroupTriggerConfig::default(),
            max_message_length: 0,
            processor: Processor::default(),
            media_store: None,
            capabilities: ChannelCapabilities::default(),
            placeholder_recorder: None,
            recent_msg_ids: DashMap::new(),
            dedupe_count: AtomicI64::new(0),
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_group_trigger(mut self, gt: GroupTriggerConfig) -> Self {
        self.group_trigger = gt;
        self
    }

    pub fn with_max_message_length(mut self, n: usize) -> Self {
        self.max_message_length = n;
        self
    }

    pub fn with_processor(mut self, processor: Processor) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_media_store(mut self, store: Arc<dyn MediaStore>) -> Self {
        self.media_store = Some(store);
        self
    }

    pub fn with_capabilities(mut self, caps: ChannelCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_placeholder_recorder(mut self, recorder: Arc<dyn PlaceholderRecorder>) -> Self {
        self.placeholder_recorder = Some(recorder);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    // -- admission ----------------------------------------------------------

    /// Legacy string admission with compound `id|username` decomposition.
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        if self.allow_list.is_empty() {
            return true;
        }
        self.allow_list
            .iter()
            .any(|allowed| identity::match_allowed_legacy(sender_id, allowed))
    }

    /// Structured admission over a [`SenderInfo`].
    pub fn is_allowed_sender(&self, sender: &SenderInfo) -> bool {
        if self.allow_list.is_empty() {
            return true;
        }
        self.allow_list
            .iter()
            .any(|allowed| identity::match_allowed(sender, allowed))
    }

    // -- group trigger ------------------------------------------------------

    /// Decide whether the bot should respond in a group chat.
    ///
    /// The concrete channel detects mentions and strips the bot mention
    /// from content before calling in. Returns the decision plus the
    /// (possibly prefix-stripped) content to use.
    pub fn should_respond_in_group(&self, is_mentioned: bool, content: &str) -> (bool, String) {
        let gt = &self.group_trigger;

        if is_mentioned {
            return (true, content.trim().to_string());
        }

        if gt.mention_only {
            return (false, content.to_string());
        }

        if !gt.prefixes.is_empty() {
            for prefix in &gt.prefixes {
                if !prefix.is_empty() {
                    if let Some(rest) = content.strip_prefix(prefix.as_str()) {
                        return (true, rest.trim().to_string());
                    }
                }
            }
            // Prefixes configured but none matched and not mentioned.
            return (false, content.to_string());
        }

        // No group trigger configured: permissive default.
        (true, content.trim().to_string())
    }

    // -- de-duplication -----------------------------------------------------

    /// True when this message id was already seen inside the dedup window.
    fn should_skip_duplicate(&self, message_id: &str, metadata: &HashMap<String, String>) -> bool {
        let mut msg_id = message_id.trim();
        if msg_id.is_empty() {
            msg_id = metadata
                .get("message_id")
                .map(|s| s.trim())
                .unwrap_or_default();
        }
        if msg_id.is_empty() {
            return false;
        }

        // Atomic load-or-store: only the first caller inserts.
        let mut inserted = false;
        self.recent_msg_ids
            .entry(msg_id.to_string())
            .or_insert_with(|| {
                inserted = true;
                Instant::now()
            });
        if !inserted {
            debug!(channel = %self.name, message_id = %msg_id, "duplicate message skipped");
            return true;
        }

        if self.dedupe_count.fetch_add(1, Ordering::Relaxed) + 1 >= DEDUPE_CLEAN_THRESHOLD {
            self.clean_expired_dedupe_entries();
        }
        false
    }

    /// Remove message IDs older than the expiry window and reset the
    /// approximate admit counter.
    fn clean_expired_dedupe_entries(&self) {
        let cutoff = Instant::now() - DEDUPE_EXPIRY;
        self.recent_msg_ids.retain(|_, seen| *seen >= cutoff);
        self.dedupe_count.store(0, Ordering::Relaxed);
    }

    // -- ingress ------------------------------------------------------------

    /// Normalize an inbound platform event and publish it to the bus.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_message(
        &self,
        peer: Peer,
        message_id: &str,
        sender_id: &str,
        chat_id: &str,
        content: &str,
        media: Vec<String>,
        metadata: HashMap<String, String>,
        sender: Option<SenderInfo>,
    ) {
        self.handle_message_with_file_refs(
            peer, message_id, sender_id, chat_id, content, media, Vec::new(), metadata, sender,
        )
        .await;
    }

    /// Like [`handle_message`](Self::handle_message) but with lazy file
    /// references for platforms backed by permanent resource stores.
    /// Hybrid payloads (legacy media + refs) are supported.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_message_with_file_refs(
        &self,
        peer: Peer,
        message_id: &str,
        sender_id: &str,
        chat_id: &str,
        content: &str,
        media: Vec<String>,
        file_refs: Vec<FileRef>,
        metadata: HashMap<String, String>,
        sender: Option<SenderInfo>,
    ) {
        let sender = sender.unwrap_or_default();
        if sender.is_structured() {
            if !self.is_allowed_sender(&sender) {
                return;
            }
        } else if !self.is_allowed(sender_id) {
            return;
        }

        if self.should_skip_duplicate(message_id, &metadata) {
            return;
        }

        // Canonical id wins over the raw platform string when available.
        let resolved_sender_id = if sender.canonical_id.is_empty() {
            sender_id.to_string()
        } else {
            sender.canonical_id.clone()
        };

        let scope = build_media_scope(&self.name, chat_id, message_id);

        let processable = self.resolve_processable_media_paths(&media).await;
        let encoded_images = media::encode_image_media(&processable).await;
        let (attachments, attachment_errors) = self.processor.process(&processable).await;
        let attachment_errors = filter_attachment_errors_by_content(content, attachment_errors);

        let msg = InboundMessage {
            channel: self.name.clone(),
            sender_id: resolved_sender_id,
            sender,
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media,
            encoded_images,
            attachments,
            attachment_errors,
            file_refs,
            peer: peer.clone(),
            message_id: message_id.to_string(),
            media_scope: scope,
            session_key: session_key(&self.name, &peer, chat_id),
            metadata,
        };

        self.fire_capabilities(chat_id, message_id).await;

        if let Err(e) = self.bus.publish_inbound(msg).await {
            error!(
                channel = %self.name,
                chat_id = %chat_id,
                error = %e,
                "failed to publish inbound message"
            );
        }
    }

    /// Invoke whichever capabilities the concrete channel registered.
    /// Failures are ignored; the reply pipeline never depends on them.
    async fn fire_capabilities(&self, chat_id: &str, message_id: &str) {
        let Some(recorder) = &self.placeholder_recorder else {
            return;
        };

        if let Some(tc) = &self.capabilities.typing {
            if let Ok(stop) = tc.start_typing(chat_id).await {
                recorder.record_typing_stop(&self.name, chat_id, stop);
            }
        }
        if let Some(rc) = &self.capabilities.reaction {
            if !message_id.is_empty() {
                if let Ok(undo) = rc.react_to_message(chat_id, message_id).await {
                    recorder.record_reaction_undo(&self.name, chat_id, undo);
                }
            }
        }
        if let Some(pc) = &self.capabilities.placeholder {
            if let Ok(ph_id) = pc.send_placeholder(chat_id).await {
                if !ph_id.is_empty() {
                    recorder.record_placeholder(&self.name, chat_id, ph_id);
                }
            }
        }
    }

    /// Drop empty entries, resolve `media://` refs through the injected
    /// store, and keep only paths that still exist on disk.
    async fn resolve_processable_media_paths(&self, media: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(media.len());
        for item in media {
            let mut path = item.trim().to_string();
            if path.is_empty() {
                continue;
            }

            if path.starts_with("media://") {
                let Some(store) = &self.media_store else {
                    continue;
                };
                match store.resolve(&path) {
                    Ok(resolved) => path = resolved,
                    Err(e) => {
                        debug!(reference = %path, error = %e, "skip unresolved media ref");
                        continue;
                    }
                }
            }

            if tokio::fs::metadata(&path).await.is_err() {
                continue;
            }
            out.push(path);
        }
        out
    }
}

/// Session key derivation: direct peers group by chat, group/channel
/// peers by the peer id so every member shares one conversation.
fn session_key(channel: &str, peer: &Peer, chat_id: &str) -> String {
    match peer.kind {
        PeerKind::Direct => format!("{channel}:{chat_id}"),
        PeerKind::Group | PeerKind::Channel => {
            let id = if peer.id.is_empty() { chat_id } else { &peer.id };
            format!("{channel}:{id}")
        }
    }
}

/// Channels that transcribe voice notes put the transcription into the
/// message content; the matching `audio_not_supported` error would only
/// confuse the model, so it is dropped.
fn filter_attachment_errors_by_content(
    content: &str,
    errs: Vec<AttachmentError>,
) -> Vec<AttachmentError> {
    if errs.is_empty() {
        return errs;
    }

    let lowered = content.to_lowercase();
    let has_transcription =
        lowered.contains("audio transcription:") || lowered.contains("voice transcription:");
    if !has_transcription {
        return errs;
    }

    errs.into_iter()
        .filter(|e| e.code != "audio_not_supported")
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn base(allow: Vec<String>) -> BaseChannel {
        BaseChannel::new("test", Arc::new(MessageBus::new()), allow)
    }

    #[test]
    fn empty_allowlist_admits_all() {
        let ch = base(vec![]);
        assert!(ch.is_allowed("anyone"));
    }

    #[test]
    fn compound_sender_matches_numeric_entry() {
        let ch = base(vec!["123456".into()]);
        assert!(ch.is_allowed("123456|alice"));
        assert!(!ch.is_allowed("654321|bob"));
    }

    #[test]
    fn compound_sender_matches_username_entry() {
        let ch = base(vec!["@alice".into()]);
        assert!(ch.is_allowed("123456|alice"));
    }

    #[test]
    fn numeric_sender_matches_legacy_compound_entry() {
        let ch = base(vec!["123456|alice".into()]);
        assert!(ch.is_allowed("123456"));
    }

    #[test]
    fn structured_sender_admission() {
        let ch = base(vec!["telegram:123456".into()]);
        let sender = SenderInfo {
            platform: "telegram".into(),
            platform_id: "123456".into(),
            canonical_id: "telegram:123456".into(),
            username: "alice".into(),
            display_name: String::new(),
        };
        assert!(ch.is_allowed_sender(&sender));

        let other = SenderInfo {
            canonical_id: "discord:123456".into(),
            platform_id: "123456x".into(),
            ..Default::default()
        };
        assert!(!ch.is_allowed_sender(&other));
    }

    #[test]
    fn group_trigger_table() {
        // mentioned → always respond, trimmed
        let ch = base(vec![]).with_group_trigger(GroupTriggerConfig {
            mention_only: true,
            prefixes: vec!["/ask".into()],
        });
        let (respond, content) = ch.should_respond_in_group(true, "  hello  ");
        assert!(respond);
        assert_eq!(content, "hello");

        // mention_only, not mentioned → ignore
        let (respond, _) = ch.should_respond_in_group(false, "hello");
        assert!(!respond);

        // prefix match strips prefix
        let ch = base(vec![]).with_group_trigger(GroupTriggerConfig {
            mention_only: false,
            prefixes: vec!["/ask".into(), "/bot".into()],
        });
        let (respond, content) = ch.should_respond_in_group(false, "/bot help me");
        assert!(respond);
        assert_eq!(content, "help me");

        // prefixes configured but unmatched → ignore
        let (respond, _) = ch.should_respond_in_group(false, "hello world");
        assert!(!respond);

        // no config → permissive
        let ch = base(vec![]);
        let (respond, content) = ch.should_respond_in_group(false, "hello world");
        assert!(respond);
        assert_eq!(content, "hello world");

        // empty prefix entries are skipped
        let ch = base(vec![]).with_group_trigger(GroupTriggerConfig {
            mention_only: false,
            prefixes: vec!["".into(), "/ask".into()],
        });
        let (respond, content) = ch.should_respond_in_group(false, "/ask test");
        assert!(respond);
        assert_eq!(content, "test");
    }

    #[test]
    fn media_scope_uses_message_id_or_unique() {
        assert_eq!(build_media_scope("tg", "c1", "m1"), "tg:c1:m1");

        let a = build_media_scope("tg", "c1", "");
        let b = build_media_scope("tg", "c1", "");
        assert!(a.starts_with("tg:c1:"));
        assert_ne!(a, b);
    }

    #[test]
    fn transcription_drops_audio_errors_only() {
        let errs = vec![
            AttachmentError {
                name: "v.ogg".into(),
                code: "audio_not_supported".into(),
                reason: String::new(),
                user_message: "x".into(),
            },
            AttachmentError {
                name: "big.pdf".into(),
                code: "file_too_large".into(),
                reason: String::new(),
                user_message: "y".into(),
            },
        ];

        let kept =
            filter_attachment_errors_by_content("[voice transcription: hi]", errs.clone());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].code, "file_too_large");

        let kept = filter_attachment_errors_by_content("[audio: v.ogg]", errs);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn session_keys_by_peer_kind() {
        let direct = Peer {
            kind: PeerKind::Direct,
            id: "u9".into(),
        };
        assert_eq!(session_key("tg", &direct, "chat1"), "tg:chat1");

        let group = Peer {
            kind: PeerKind::Group,
            id: "g7".into(),
        };
        assert_eq!(session_key("tg", &group, "chat1"), "tg:g7");
    }

    #[tokio::test]
    async fn dedup_skips_second_publish() {
        let bus = Arc::new(MessageBus::new());
        let ch = BaseChannel::new("test", bus.clone(), vec![]);
        let peer = Peer {
            kind: PeerKind::Direct,
            id: "c1".into(),
        };

        for _ in 0..2 {
            ch.handle_message(
                peer.clone(),
                "msg_001",
                "user1",
                "c1",
                "hello",
                vec![],
                HashMap::new(),
                None,
            )
            .await;
        }

        let cancel = CancellationToken::new();
        let first = bus.consume_inbound(&cancel).await;
        assert!(first.is_some());

        cancel.cancel();
        assert!(bus.consume_inbound(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn metadata_message_id_dedups() {
        let bus = Arc::new(MessageBus::new());
        let ch = BaseChannel::new("test", bus.clone(), vec![]);
        let peer = Peer::default();
        let meta: HashMap<String, String> =
            [("message_id".to_string(), "msg_meta".to_string())].into();

        for _ in 0..2 {
            ch.handle_message(peer.clone(), "", "u", "c", "hi", vec![], meta.clone(), None)
                .await;
        }

        let cancel = CancellationToken::new();
        assert!(bus.consume_inbound(&cancel).await.is_some());
        cancel.cancel();
        assert!(bus.consume_inbound(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn empty_message_id_skips_dedup() {
        let bus = Arc::new(MessageBus::new());
        let ch = BaseChannel::new("test", bus.clone(), vec![]);
        let peer = Peer::default();

        for _ in 0..2 {
            ch.handle_message(peer.clone(), "", "u", "c", "hi", vec![], HashMap::new(), None)
                .await;
        }

        let cancel = CancellationToken::new();
        assert!(bus.consume_inbound(&cancel).await.is_some());
        assert!(bus.consume_inbound(&cancel).await.is_some());
    }
}
