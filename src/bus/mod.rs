//! Message bus: typed inbound/outbound envelopes plus a buffered
//! in-process handoff with cancel-aware consume.
//!
//! Envelopes serialize to snake_case JSON for logging and replay.  The
//! bus itself is a pair of bounded queues — no persistence, no ordering
//! guarantees across publishers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Media & attachment types
// ---------------------------------------------------------------------------

/// A base64-encoded image ready for LLM consumption.
///
/// Images are encoded eagerly in the channel layer so temp files can be
/// cleaned up before the agent loop runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncodedImage {
    /// e.g. "image/jpeg", "image/png"
    pub media_type: String,
    /// base64-encoded image data
    pub data: String,
}

/// Classifies inbound media for downstream processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Document,
    #[default]
    Unknown,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Video => "video",
            AttachmentKind::Document => "document",
            AttachmentKind::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for AttachmentKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "image" => AttachmentKind::Image,
            "audio" => AttachmentKind::Audio,
            "video" => AttachmentKind::Video,
            "document" => AttachmentKind::Document,
            _ => AttachmentKind::Unknown,
        })
    }
}

/// One inbound media file and its optionally extracted text.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    pub kind: AttachmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
}

/// A failed attachment parsing attempt.
///
/// `user_message` is a complete user-facing sentence naming the file and
/// the concrete failure, so the model can relay it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentError {
    pub name: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    pub user_message: String,
}

/// Origin platform of a lazy file reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileRefSource {
    /// Feishu resource reference (message_id + file_key).
    Feishu,
    /// Catch-all for resolvers registered at runtime.
    #[serde(untagged)]
    Other(String),
}

impl FileRefSource {
    pub fn as_str(&self) -> &str {
        match self {
            FileRefSource::Feishu => "feishu",
            FileRefSource::Other(s) => s,
        }
    }
}

/// A lazy file reference resolved on demand.
///
/// Channels backed by permanent resource stores construct `FileRef`s
/// instead of downloading eagerly; the context builder resolves them just
/// before the LLM request.  The platform identifiers are opaque to every
/// component except the matching resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub kind: AttachmentKind,
    pub source: FileRefSource,

    /// Platform resource identifiers (e.g. Feishu message_id + file_key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    /// "image" or "file" on platforms that distinguish resource types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Sender & peer
// ---------------------------------------------------------------------------

/// Structured sender identity.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SenderInfo {
    /// "telegram", "discord", "slack", ...
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    /// Raw platform ID, e.g. "123456".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform_id: String,
    /// "platform:id" format.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub canonical_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

impl SenderInfo {
    /// True when the sender carries any structured identity at all.
    pub fn is_structured(&self) -> bool {
        !self.canonical_id.is_empty() || !self.platform_id.is_empty()
    }
}

/// Routing peer kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    #[default]
    Direct,
    Group,
    Channel,
}

/// Identifies the routing peer of a message.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Peer {
    pub kind: PeerKind,
    pub id: String,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Channel-normalized inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender: SenderInfo,
    pub chat_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encoded_images: Vec<EncodedImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_errors: Vec<AttachmentError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_refs: Vec<FileRef>,
    #[serde(default)]
    pub peer: Peer,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    /// Media lifecycle scope: `channel:chat_id:message_id`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_scope: String,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Plain-text reply from agent to channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

/// A single media attachment to send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPart {
    /// "image" | "audio" | "video" | "file"
    pub r#type: String,
    /// Media store ref, e.g. "media://abc123".
    pub r#ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caption: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
}

/// Media reply from agent to channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMediaMessage {
    pub channel: String,
    pub chat_id: String,
    pub parts: Vec<MediaPart>,
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// Capacity of each bounded queue.
const BUS_CAPACITY: usize = 256;

/// Buffered in-process bus for inbound and outbound messages.
///
/// `publish_*` fails once the matching consumer side has been closed.
/// `consume_*` is cancel-aware: it returns `None` when the cancellation
/// token fires or all publishers are gone.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
    media_tx: mpsc::Sender<OutboundMediaMessage>,
    media_rx: Mutex<mpsc::Receiver<OutboundMediaMessage>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(BUS_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(BUS_CAPACITY);
        let (media_tx, media_rx) = mpsc::channel(BUS_CAPACITY);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            media_tx,
            media_rx: Mutex::new(media_rx),
        }
    }

    /// Publish an inbound message. Errors when the bus is closed.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> anyhow::Result<()> {
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("bus closed: inbound consumer gone"))
    }

    /// Publish an outbound message. Errors when the bus is closed.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("bus closed: outbound consumer gone"))
    }

    /// Publish an outbound media message. Errors when the bus is closed.
    pub async fn publish_outbound_media(&self, msg: OutboundMediaMessage) -> anyhow::Result<()> {
        self.media_tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("bus closed: media consumer gone"))
    }

    /// Receive the next inbound message, or `None` on cancellation / close.
    pub async fn consume_inbound(&self, cancel: &CancellationToken) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    /// Receive the next outbound message, or `None` on cancellation / close.
    pub async fn consume_outbound(&self, cancel: &CancellationToken) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    /// Receive the next outbound media message, or `None` on cancellation / close.
    pub async fn consume_outbound_media(
        &self,
        cancel: &CancellationToken,
    ) -> Option<OutboundMediaMessage> {
        let mut rx = self.media_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_then_consume() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();

        bus.publish_inbound(InboundMessage {
            channel: "test".into(),
            content: "hello".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let msg = bus.consume_inbound(&cancel).await.unwrap();
        assert_eq!(msg.channel, "test");
        assert_eq!(msg.content, "hello");
    }

    #[tokio::test]
    async fn consume_returns_none_on_cancel() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        let child = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        assert!(bus.consume_inbound(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn outbound_roundtrip() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();

        bus.publish_outbound(OutboundMessage {
            channel: "test".into(),
            chat_id: "c1".into(),
            content: "reply".into(),
        })
        .await
        .unwrap();

        let msg = bus.consume_outbound(&cancel).await.unwrap();
        assert_eq!(msg.content, "reply");
    }

    #[test]
    fn inbound_serializes_snake_case() {
        let msg = InboundMessage {
            channel: "telegram".into(),
            sender_id: "telegram:42".into(),
            chat_id: "chat9".into(),
            content: "hi".into(),
            message_id: "m1".into(),
            media_scope: "telegram:chat9:m1".into(),
            session_key: "telegram:chat9".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["sender_id"], "telegram:42");
        assert_eq!(json["media_scope"], "telegram:chat9:m1");
        assert_eq!(json["session_key"], "telegram:chat9");
        // Empty optional collections are omitted entirely.
        assert!(json.get("encoded_images").is_none());
    }

    #[test]
    fn file_ref_roundtrip_preserves_platform_ids() {
        let r = FileRef {
            name: "report.pdf".into(),
            media_type: "application/pdf".into(),
            size_bytes: None,
            kind: AttachmentKind::Document,
            source: FileRefSource::Feishu,
            message_id: Some("om_123".into()),
            file_key: Some("key_456".into()),
            resource_type: Some("file".into()),
        };
        let json = serde_json::to_string(&r).unwrap();
        let back: FileRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back.source, FileRefSource::Feishu);
        assert_eq!(back.file_key.as_deref(), Some("key_456"));
    }
}
