#![allow(dead_code)]

use async_trait::async_trait;
use sealsearch::config::EngineConfig;
use sealsearch::crypto::MemoryStorage;
use sealsearch::errors::{EngineError, EngineResult};
use sealsearch::mailbox::{
    BackgroundTask, Mailbox, MessageDecryptor, MessageMetadata, MessagePage,
};
use sealsearch::memory::FixedMemory;
use sealsearch::types::Participant;
use sealsearch::{Collaborators, SearchEngine};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const ALL_MAIL: &str = "5";

type PageHook = Box<dyn Fn(usize) + Send + Sync>;

/// Scripted mailbox: pages newest first, records every request.
pub struct FakeMailbox {
    messages: Mutex<Vec<(MessageMetadata, String)>>,
    page_size: usize,
    failing_pages: AtomicUsize,
    page_requests: Mutex<Vec<Option<i64>>>,
    detail_calls: Mutex<HashMap<String, usize>>,
    on_page: Mutex<Option<PageHook>>,
}

impl FakeMailbox {
    pub fn new(page_size: usize, messages: Vec<(MessageMetadata, String)>) -> Self {
        Self {
            messages: Mutex::new(messages),
            page_size,
            failing_pages: AtomicUsize::new(0),
            page_requests: Mutex::new(Vec::new()),
            detail_calls: Mutex::new(HashMap::new()),
            on_page: Mutex::new(None),
        }
    }

    /// The next `n` page fetches fail with a network error.
    pub fn fail_next_pages(&self, n: usize) {
        self.failing_pages.store(n, Ordering::SeqCst);
    }

    /// Called with the 1-based number of every page request.
    pub fn on_page(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_page.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn page_requests(&self) -> Vec<Option<i64>> {
        self.page_requests.lock().unwrap().clone()
    }

    pub fn detail_calls(&self, id: &str) -> usize {
        self.detail_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_detail_calls(&self) -> usize {
        self.detail_calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn fetch_page(&self, label: &str, end_time: Option<i64>) -> EngineResult<MessagePage> {
        assert_eq!(label, ALL_MAIL);
        let call = {
            let mut requests = self.page_requests.lock().unwrap();
            requests.push(end_time);
            requests.len()
        };
        if let Some(hook) = self.on_page.lock().unwrap().as_ref() {
            hook(call);
        }

        let failing = self.failing_pages.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_pages.store(failing - 1, Ordering::SeqCst);
            return Err(EngineError::Network("connection reset".into()));
        }

        let all = self.messages.lock().unwrap();
        let mut page: Vec<MessageMetadata> = all
            .iter()
            .map(|(meta, _)| meta.clone())
            .filter(|m| end_time.map_or(true, |end| m.timestamp <= end))
            .collect();
        page.sort_by(|a, b| (b.timestamp, b.order).cmp(&(a.timestamp, a.order)));
        page.truncate(self.page_size);

        Ok(MessagePage {
            messages: page,
            total: all.len() as u64,
            limit: self.page_size,
        })
    }

    async fn fetch_detail(&self, message_id: &str) -> EngineResult<MessageMetadata> {
        *self
            .detail_calls
            .lock()
            .unwrap()
            .entry(message_id.to_string())
            .or_default() += 1;

        let all = self.messages.lock().unwrap();
        let (meta, body) = all
            .iter()
            .find(|(m, _)| m.id == message_id)
            .ok_or_else(|| EngineError::Network(format!("no message {message_id}")))?;
        let mut detail = meta.clone();
        detail.detail_downloaded = true;
        detail.body = Some(body.clone());
        Ok(detail)
    }
}

/// "Decrypts" by returning the stored body; bodies starting with CORRUPT fail.
pub struct FakeDecryptor;

impl MessageDecryptor for FakeDecryptor {
    fn decrypt(&self, message: &MessageMetadata) -> EngineResult<String> {
        match message.body.as_deref() {
            Some(body) if body.starts_with("CORRUPT") => {
                Err(EngineError::Decryption("bad session key".into()))
            }
            Some(body) => Ok(body.to_string()),
            None => Err(EngineError::Decryption("no body".into())),
        }
    }
}

#[derive(Default)]
pub struct CountingBackground {
    pub begins: AtomicUsize,
    pub ends: AtomicUsize,
}

impl BackgroundTask for CountingBackground {
    fn begin(&self) {
        self.begins.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn message(id: &str, timestamp: i64, subject: &str, body: &str) -> (MessageMetadata, String) {
    let meta = MessageMetadata {
        id: id.to_string(),
        timestamp,
        order: timestamp,
        label_ids: labels(&["0", ALL_MAIL]),
        location: 0,
        subject: subject.to_string(),
        sender: Participant::new("Alice Example", "alice@example.com"),
        to_list: vec![Participant::new("Bob", "bob@example.com")],
        mime_type: "text/html".to_string(),
        ..MessageMetadata::default()
    };
    (meta, format!("<html><body>{body}</body></html>"))
}

pub fn labels(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: Some(dir.to_path_buf()),
        retry_backoff_ms: 1,
        storage_limit_bytes: None,
        ..EngineConfig::default()
    }
}

pub fn collaborators(
    mailbox: Arc<FakeMailbox>,
    background: Arc<CountingBackground>,
    memory_bytes: u64,
) -> Collaborators {
    Collaborators {
        mailbox,
        decryptor: Arc::new(FakeDecryptor),
        background,
        secure_storage: Arc::new(MemoryStorage::new()),
        memory: Arc::new(FixedMemory(memory_bytes)),
    }
}

pub async fn open_engine(
    dir: &Path,
    config: EngineConfig,
    mailbox: Arc<FakeMailbox>,
) -> (SearchEngine, Arc<CountingBackground>) {
    let background = Arc::new(CountingBackground::default());
    let engine = SearchEngine::open(
        "alice",
        EngineConfig {
            data_dir: Some(dir.to_path_buf()),
            ..config
        },
        collaborators(mailbox, background.clone(), 64 * 1024 * 1024),
    )
    .await
    .expect("open engine");
    (engine, background)
}
