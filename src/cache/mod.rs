//! Bounded decrypted working set of the most recent index rows.
use crate::config::EngineConfig;
use crate::crypto::SearchCipher;
use crate::errors::{EngineError, EngineResult};
use crate::memory::{budget_items, MemoryProbe};
use crate::search::Searcher;
use crate::storage::IndexStore;
use crate::types::{DecryptedMessageContent, IndexedMessage, MessageRef, ScanCursor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

const MAX_CACHE_ROWS: usize = u32::MAX as usize;

pub struct CachedMessage {
    pub reference: MessageRef,
    pub content: DecryptedMessageContent,
    haystack: String,
}

impl CachedMessage {
    pub fn haystack(&self) -> &str {
        &self.haystack
    }
}

pub struct SearchCache {
    entries: Vec<CachedMessage>,
    capacity: usize,
    loaded_rows: usize,
    boundary: Option<ScanCursor>,
}

impl SearchCache {
    pub async fn build(
        store: &IndexStore,
        cipher: Arc<SearchCipher>,
        memory: &dyn MemoryProbe,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let started = Instant::now();
        let capacity = budget_items(
            memory.available_bytes(),
            config.cache_memory_fraction,
            config.cache_message_bytes,
            1,
            MAX_CACHE_ROWS,
        );

        let rows = store.scan(None, capacity).await?;
        let loaded_rows = rows.len();
        let boundary = rows.last().map(IndexedMessage::cursor);

        let entries = tokio::task::spawn_blocking(move || decrypt_rows(&cipher, rows))
            .await
            .map_err(|e| EngineError::Unexpected(format!("cache decrypt task failed: {e}")))?;

        info!(
            capacity,
            loaded = loaded_rows,
            searchable = entries.len(),
            elapsed_ms = ?started.elapsed().as_millis(),
            "Built search cache"
        );

        Ok(Self {
            entries,
            capacity,
            loaded_rows,
            boundary,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the cache holds every row of the index, so a scan of the
    /// store cannot find anything more.
    pub fn covers_whole_index(&self) -> bool {
        self.loaded_rows < self.capacity
    }

    /// Scan position of the oldest cached row; the index scan resumes here.
    pub fn boundary(&self) -> Option<&ScanCursor> {
        self.boundary.as_ref()
    }

    /// All matching cached messages, newest first.
    pub fn search(&self, searcher: &Searcher) -> Vec<MessageRef> {
        self.entries
            .iter()
            .filter(|entry| searcher.matches_text(entry.haystack()))
            .map(|entry| entry.reference.clone())
            .collect()
    }
}

fn decrypt_rows(cipher: &SearchCipher, rows: Vec<IndexedMessage>) -> Vec<CachedMessage> {
    use rayon::prelude::*;
    rows.into_par_iter()
        .filter(IndexedMessage::is_searchable)
        .filter_map(|row| {
            let (Some(ct), Some(iv)) = (&row.encrypted_content, &row.encryption_iv) else {
                return None;
            };
            match cipher.decrypt(ct, iv) {
                Ok(content) => Some(CachedMessage {
                    haystack: content.searchable_text(),
                    reference: row.reference(),
                    content,
                }),
                Err(e) => {
                    debug!(message_id = %row.message_id, error = %e, "Skipping undecryptable row");
                    None
                }
            }
        })
        .collect()
}

/// Holds the current cache, building it on first use. Every invalidation
/// bumps the generation so results computed against a stale cache can be
/// told apart.
#[derive(Default)]
pub struct CacheSlot {
    current: Mutex<Option<Arc<SearchCache>>>,
    generation: AtomicU64,
}

impl CacheSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
        debug!("Invalidated search cache");
    }

    pub fn cached(&self) -> Option<Arc<SearchCache>> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    pub async fn get_or_build(
        &self,
        store: &IndexStore,
        cipher: Arc<SearchCipher>,
        memory: &dyn MemoryProbe,
        config: &EngineConfig,
    ) -> EngineResult<Arc<SearchCache>> {
        if let Some(cache) = self.cached() {
            return Ok(cache);
        }

        let generation = self.generation();
        let cache = Arc::new(SearchCache::build(store, cipher, memory, config).await?);

        if self.generation() == generation {
            if let Ok(mut current) = self.current.lock() {
                *current = Some(cache.clone());
            }
        }
        Ok(cache)
    }
}
