use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Separator used when label ids are flattened into a single column.
pub const LABEL_SEPARATOR: char = ';';

/// One row of the search index. Exactly one per live mailbox message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedMessage {
    pub message_id: String,
    pub timestamp: i64,
    pub order: i64,
    pub label_ids: BTreeSet<String>,
    pub location: i64,
    pub has_body: bool,
    pub decryption_failed: bool,
    pub encryption_iv: Option<String>,
    pub encrypted_content: Option<String>,
    /// Name of the blob file holding the ciphertext when it was too large to inline.
    pub encrypted_content_file: Option<String>,
    pub encrypted_content_size: i64,
}

impl IndexedMessage {
    /// A row that marks the message as indexed but carries no content.
    pub fn metadata_only(
        message_id: &str,
        timestamp: i64,
        order: i64,
        label_ids: BTreeSet<String>,
        location: i64,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            timestamp,
            order,
            label_ids,
            location,
            has_body: false,
            decryption_failed: false,
            encryption_iv: None,
            encrypted_content: None,
            encrypted_content_file: None,
            encrypted_content_size: 0,
        }
    }

    pub fn with_content(mut self, payload: EncryptedPayload) -> Self {
        self.has_body = true;
        self.decryption_failed = false;
        self.encryption_iv = Some(payload.iv);
        self.encrypted_content = Some(payload.ciphertext);
        self.encrypted_content_size = payload.size;
        self
    }

    pub fn mark_decryption_failed(mut self) -> Self {
        self.has_body = false;
        self.decryption_failed = true;
        self.encryption_iv = None;
        self.encrypted_content = None;
        self.encrypted_content_file = None;
        self.encrypted_content_size = 0;
        self
    }

    /// Rows without trustworthy content contribute no search tokens.
    pub fn is_searchable(&self) -> bool {
        self.has_body
            && !self.decryption_failed
            && self.encryption_iv.is_some()
            && self.encrypted_content.is_some()
    }

    pub fn reference(&self) -> MessageRef {
        MessageRef {
            message_id: self.message_id.clone(),
            timestamp: self.timestamp,
            order: self.order,
            label_ids: self.label_ids.clone(),
            location: self.location,
        }
    }

    pub fn cursor(&self) -> ScanCursor {
        ScanCursor {
            timestamp: self.timestamp,
            order: self.order,
            message_id: self.message_id.clone(),
        }
    }
}

/// Ciphertext and nonce, both base64, plus the raw ciphertext length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
    pub size: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub address: String,
}

impl Participant {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
        }
    }
}

/// The structured plaintext that gets encrypted into a row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessageContent {
    pub subject: String,
    pub sender: Participant,
    pub to_list: Vec<Participant>,
    pub cc_list: Vec<Participant>,
    pub bcc_list: Vec<Participant>,
    pub body: String,
}

impl DecryptedMessageContent {
    /// Lowercased haystack that keyword matching runs against.
    pub fn searchable_text(&self) -> String {
        let mut out = String::with_capacity(self.subject.len() + self.body.len() + 64);
        out.push_str(&self.subject);
        for participant in std::iter::once(&self.sender)
            .chain(self.to_list.iter())
            .chain(self.cc_list.iter())
            .chain(self.bcc_list.iter())
        {
            out.push(' ');
            out.push_str(&participant.name);
            out.push(' ');
            out.push_str(&participant.address);
        }
        out.push(' ');
        out.push_str(&self.body);
        out.to_lowercase()
    }
}

/// What a search hands back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRef {
    pub message_id: String,
    pub timestamp: i64,
    pub order: i64,
    pub label_ids: BTreeSet<String>,
    pub location: i64,
}

/// Keyset position in the newest-first scan order `(timestamp, order, message_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanCursor {
    pub timestamp: i64,
    pub order: i64,
    pub message_id: String,
}

#[derive(Clone, Debug, Default)]
pub struct MessageUpdate {
    pub timestamp: Option<i64>,
    pub order: Option<i64>,
    pub label_ids: Option<BTreeSet<String>>,
    pub location: Option<i64>,
    pub content: Option<EncryptedPayload>,
}

impl MessageUpdate {
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none()
            && self.order.is_none()
            && self.label_ids.is_none()
            && self.location.is_none()
            && self.content.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BuildPhase {
    Idle,
    Building,
    Paused,
    Completing,
}

/// Every pause trigger is tracked on its own so clearing one never resumes
/// a build that another trigger still holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PauseReasons {
    pub user: bool,
    pub network: bool,
    pub thermal: bool,
    pub background_time: bool,
    pub fetch_failures: bool,
    pub storage_failures: bool,
}

impl PauseReasons {
    pub fn is_empty(&self) -> bool {
        *self == PauseReasons::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IndexState {
    Disabled,
    Downloading,
    Paused,
    Partial,
    Complete,
}

/// Snapshot consumed by progress/UI observers.
#[derive(Clone, Debug, Serialize)]
pub struct BuildProgress {
    pub phase: BuildPhase,
    pub pause_reasons: PauseReasons,
    pub processed: u64,
    pub total: u64,
    pub percent: f64,
    pub minutes_remaining: Option<u64>,
    pub index_size_bytes: u64,
    pub partial: bool,
    pub last_error: Option<String>,
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self {
            phase: BuildPhase::Idle,
            pause_reasons: PauseReasons::default(),
            processed: 0,
            total: 0,
            percent: 0.0,
            minutes_remaining: None,
            index_size_bytes: 0,
            partial: false,
            last_error: None,
        }
    }
}

impl BuildProgress {
    pub fn index_state(&self) -> IndexState {
        match self.phase {
            BuildPhase::Building | BuildPhase::Completing => IndexState::Downloading,
            BuildPhase::Paused => IndexState::Paused,
            BuildPhase::Idle if self.partial => IndexState::Partial,
            BuildPhase::Idle
                if self.percent >= 100.0 || (self.total > 0 && self.processed >= self.total) =>
            {
                IndexState::Complete
            }
            BuildPhase::Idle if self.processed > 0 => IndexState::Partial,
            BuildPhase::Idle => IndexState::Disabled,
        }
    }
}

pub fn join_labels(labels: &BTreeSet<String>) -> String {
    labels
        .iter()
        .map(|l| l.as_str())
        .collect::<Vec<_>>()
        .join(&LABEL_SEPARATOR.to_string())
}

pub fn split_labels(raw: &str) -> BTreeSet<String> {
    raw.split(LABEL_SEPARATOR)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
