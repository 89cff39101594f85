//! Keyword search: cache first, then a batched scan of the encrypted index.
use crate::cache::CacheSlot;
use crate::config::EngineConfig;
use crate::crypto::SearchCipher;
use crate::errors::{EngineError, EngineResult};
use crate::memory::{budget_items, MemoryProbe};
use crate::storage::IndexStore;
use crate::types::{DecryptedMessageContent, IndexedMessage, MessageRef, ScanCursor};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Lowercased whitespace-separated keywords. A message matches when every
/// keyword occurs somewhere in its subject, participants or body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Searcher {
    keywords: Vec<String>,
}

impl Searcher {
    pub fn new(query: &str) -> Self {
        Self {
            keywords: query
                .split_whitespace()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Canonical form of the query, used to recognize a repeated search.
    pub fn normalized(&self) -> String {
        self.keywords.join(" ")
    }

    /// `haystack` must already be lowercased.
    pub fn matches_text(&self, haystack: &str) -> bool {
        !self.keywords.is_empty() && self.keywords.iter().all(|k| haystack.contains(k.as_str()))
    }

    pub fn matches(&self, content: &DecryptedMessageContent) -> bool {
        self.matches_text(&content.searchable_text())
    }
}

/// Progress of one query across cache and index, kept so that asking for
/// the next page continues where the previous request stopped.
#[derive(Clone, Debug, Default)]
pub struct SearchState {
    pub query: String,
    pub cache_generation: u64,
    pub cached_search_done: bool,
    pub cache_results: Vec<MessageRef>,
    pub index_results: Vec<MessageRef>,
    pub index_cursor: Option<ScanCursor>,
    pub search_complete: bool,
}

impl SearchState {
    pub fn result_count(&self) -> usize {
        self.cache_results.len() + self.index_results.len()
    }

    fn page(&self, page: usize, page_size: usize) -> Vec<MessageRef> {
        self.cache_results
            .iter()
            .chain(self.index_results.iter())
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .cloned()
            .collect()
    }
}

pub struct SearchExecutor {
    store: Arc<IndexStore>,
    cipher: Arc<SearchCipher>,
    cache: Arc<CacheSlot>,
    memory: Arc<dyn MemoryProbe>,
    config: EngineConfig,
    state: Mutex<Option<SearchState>>,
}

impl SearchExecutor {
    pub fn new(
        store: Arc<IndexStore>,
        cipher: Arc<SearchCipher>,
        cache: Arc<CacheSlot>,
        memory: Arc<dyn MemoryProbe>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cipher,
            cache,
            memory,
            config,
            state: Mutex::new(None),
        }
    }

    /// Message references for `page` (zero-based) of the results for `query`.
    pub async fn search(&self, query: &str, page: usize) -> EngineResult<Vec<MessageRef>> {
        let searcher = Searcher::new(query);
        if searcher.is_empty() {
            return Ok(Vec::new());
        }

        let page_size = self.config.page_size;
        let needed = page.saturating_add(1).saturating_mul(page_size);
        let normalized = searcher.normalized();
        let generation = self.cache.generation();

        let mut guard = self.state.lock().await;
        let reuse = matches!(
            guard.as_ref(),
            Some(state) if state.query == normalized && state.cache_generation == generation
        );

        if !reuse {
            let mut state = self.search_cache(&searcher, normalized, generation).await?;
            // A thin cache phase keeps scanning until a useful first batch exists.
            let target = if state.cache_results.len() < self.config.min_cache_results {
                needed.max(self.config.min_cache_results)
            } else {
                needed
            };
            self.scan_index(&mut state, &searcher, target).await?;
            *guard = Some(state);
        } else if let Some(state) = guard.as_mut() {
            self.scan_index(state, &searcher, needed).await?;
        }

        Ok(guard
            .as_ref()
            .map(|state| state.page(page, page_size))
            .unwrap_or_default())
    }

    pub async fn state(&self) -> Option<SearchState> {
        self.state.lock().await.clone()
    }

    pub async fn reset(&self) {
        *self.state.lock().await = None;
    }

    async fn search_cache(
        &self,
        searcher: &Searcher,
        query: String,
        generation: u64,
    ) -> EngineResult<SearchState> {
        let cache = self
            .cache
            .get_or_build(&self.store, self.cipher.clone(), self.memory.as_ref(), &self.config)
            .await?;

        let cache_results = cache.search(searcher);
        debug!(
            query_terms = searcher.keywords().len(),
            hits = cache_results.len(),
            cached = cache.len(),
            "Cache search done"
        );

        Ok(SearchState {
            query,
            cache_generation: generation,
            cached_search_done: true,
            cache_results,
            index_results: Vec::new(),
            index_cursor: cache.boundary().cloned(),
            search_complete: cache.covers_whole_index(),
        })
    }

    /// Scans the index from the state's cursor in memory-sized batches until
    /// `needed` results exist or the index is exhausted.
    async fn scan_index(
        &self,
        state: &mut SearchState,
        searcher: &Searcher,
        needed: usize,
    ) -> EngineResult<()> {
        if state.search_complete || state.result_count() >= needed {
            return Ok(());
        }
        let started = Instant::now();
        let batch_size = budget_items(
            self.memory.available_bytes(),
            self.config.scan_memory_fraction,
            self.config.scan_row_bytes,
            self.config.min_scan_batch,
            self.config.max_scan_batch,
        );
        let mut scanned = 0usize;

        while state.result_count() < needed && !state.search_complete {
            let rows = self.store.scan(state.index_cursor.as_ref(), batch_size).await?;
            scanned += rows.len();
            if rows.len() < batch_size {
                state.search_complete = true;
            }
            if let Some(last) = rows.last() {
                state.index_cursor = Some(last.cursor());
            }
            if rows.is_empty() {
                break;
            }

            let cipher = self.cipher.clone();
            let batch_searcher = searcher.clone();
            let matches = tokio::task::spawn_blocking(move || match_rows(&cipher, &batch_searcher, rows))
                .await
                .map_err(|e| EngineError::Unexpected(format!("index scan task failed: {e}")))?;
            state.index_results.extend(matches);
        }

        info!(
            batch_size,
            scanned,
            results = state.result_count(),
            complete = state.search_complete,
            elapsed_ms = ?started.elapsed().as_millis(),
            "Index scan finished"
        );
        Ok(())
    }
}

fn match_rows(cipher: &SearchCipher, searcher: &Searcher, rows: Vec<IndexedMessage>) -> Vec<MessageRef> {
    use rayon::prelude::*;
    rows.into_par_iter()
        .filter(IndexedMessage::is_searchable)
        .filter_map(|row| {
            let (Some(ct), Some(iv)) = (&row.encrypted_content, &row.encryption_iv) else {
                return None;
            };
            match cipher.decrypt(ct, iv) {
                Ok(content) if searcher.matches(&content) => Some(row.reference()),
                Ok(_) => None,
                Err(e) => {
                    debug!(message_id = %row.message_id, error = %e, "Skipping undecryptable row");
                    None
                }
            }
        })
        .collect()
}
