//! Seams to the mail layer and the host OS. The engine only consumes these.
use crate::errors::EngineResult;
use crate::types::Participant;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Header-level view of a mailbox message, optionally with its (still
/// encrypted) body when details were already downloaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub id: String,
    pub timestamp: i64,
    pub order: i64,
    pub label_ids: BTreeSet<String>,
    pub location: i64,
    pub subject: String,
    pub sender: Participant,
    pub to_list: Vec<Participant>,
    pub cc_list: Vec<Participant>,
    pub bcc_list: Vec<Participant>,
    pub detail_downloaded: bool,
    pub body: Option<String>,
    pub mime_type: String,
}

impl MessageMetadata {
    pub fn has_detail(&self) -> bool {
        self.detail_downloaded && self.body.is_some()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MessagePage {
    pub messages: Vec<MessageMetadata>,
    /// Server-side message count for the label.
    pub total: u64,
    pub limit: usize,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Newest-first page of messages with `timestamp <= end_time`
    /// (no bound when `None`).
    async fn fetch_page(&self, label: &str, end_time: Option<i64>) -> EngineResult<MessagePage>;

    /// Full message including its encrypted body.
    async fn fetch_detail(&self, message_id: &str) -> EngineResult<MessageMetadata>;
}

/// Decrypts a downloaded message body into its raw (HTML, plain or MIME) form.
pub trait MessageDecryptor: Send + Sync {
    fn decrypt(&self, message: &MessageMetadata) -> EngineResult<String>;
}

/// OS grant that lets a build keep running while the app is backgrounded.
pub trait BackgroundTask: Send + Sync {
    fn begin(&self);
    fn end(&self);
}

#[derive(Clone, Debug)]
pub enum MailboxEvent {
    Insert(MessageMetadata),
    Update {
        message: MessageMetadata,
        body_changed: bool,
    },
    Move {
        message_id: String,
        label_ids: BTreeSet<String>,
        location: i64,
    },
    Delete {
        message_id: String,
    },
}

impl MailboxEvent {
    pub fn message_id(&self) -> &str {
        match self {
            MailboxEvent::Insert(message) | MailboxEvent::Update { message, .. } => &message.id,
            MailboxEvent::Move { message_id, .. } | MailboxEvent::Delete { message_id } => {
                message_id
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Offline,
    Wifi,
    Cellular,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemSignal {
    Network(NetworkStatus),
    Thermal(ThermalState),
    BackgroundTimeExpired,
    BackgroundTimeRenewed,
}
