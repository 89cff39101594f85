use crate::cache::CacheSlot;
use crate::config::EngineConfig;
use crate::crypto::{self, SearchCipher, SecureStorage};
use crate::errors::EngineResult;
use crate::indexer::{BuildOutcome, IndexBuilder};
use crate::mailbox::{BackgroundTask, Mailbox, MailboxEvent, MessageDecryptor, SystemSignal};
use crate::memory::MemoryProbe;
use crate::search::SearchExecutor;
use crate::storage::{IndexStore, IndexStores, ShrinkReport, StoreOptions};
use crate::types::{BuildProgress, IndexState, MessageRef};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Everything the engine needs from the host application.
#[derive(Clone)]
pub struct Collaborators {
    pub mailbox: Arc<dyn Mailbox>,
    pub decryptor: Arc<dyn MessageDecryptor>,
    pub background: Arc<dyn BackgroundTask>,
    pub secure_storage: Arc<dyn SecureStorage>,
    pub memory: Arc<dyn MemoryProbe>,
}

struct Session {
    store: Arc<IndexStore>,
    cache: Arc<CacheSlot>,
    builder: IndexBuilder,
    executor: SearchExecutor,
}

/// Encrypted search for one signed-in user. Owned by the user session;
/// two users mean two engines.
pub struct SearchEngine {
    user_id: String,
    config: EngineConfig,
    stores: IndexStores,
    collaborators: Collaborators,
    session: RwLock<Session>,
}

impl SearchEngine {
    pub async fn open(
        user_id: &str,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> EngineResult<Self> {
        config.validate()?;
        let dir = config.resolve_data_dir()?;
        let stores = IndexStores::new(dir, StoreOptions::from(&config));
        let session = open_session(user_id, &config, &stores, &collaborators).await?;
        info!(user = %user_id, path = %session.store.path().display(), "Search engine ready");

        Ok(Self {
            user_id: user_id.to_string(),
            config,
            stores,
            collaborators,
            session: RwLock::new(session),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a background build if the index is behind the mailbox.
    pub async fn enable(&self) -> EngineResult<bool> {
        self.session.read().await.builder.refresh().await
    }

    /// Runs a build to its end on the calling task.
    pub async fn build(&self) -> EngineResult<BuildOutcome> {
        let builder = self.builder().await;
        builder.build().await
    }

    pub async fn search(&self, query: &str, page: usize) -> EngineResult<Vec<MessageRef>> {
        self.session.read().await.executor.search(query, page).await
    }

    pub async fn handle_event(&self, event: MailboxEvent) {
        self.session.read().await.builder.submit_event(event);
    }

    pub async fn handle_signal(&self, signal: SystemSignal) {
        self.session.read().await.builder.handle_signal(signal);
    }

    pub async fn pause(&self) {
        self.session.read().await.builder.pause();
    }

    pub async fn resume(&self) {
        self.session.read().await.builder.resume();
    }

    pub async fn progress(&self) -> BuildProgress {
        self.session.read().await.builder.progress()
    }

    pub async fn index_state(&self) -> IndexState {
        self.session.read().await.builder.index_state()
    }

    pub async fn builder(&self) -> IndexBuilder {
        self.session.read().await.builder.clone()
    }

    pub async fn store(&self) -> Arc<IndexStore> {
        self.session.read().await.store.clone()
    }

    pub async fn shrink_to_fit(&self, target_bytes: u64) -> EngineResult<ShrinkReport> {
        let session = self.session.read().await;
        let report = session.store.shrink_to_fit(target_bytes).await?;
        if report.deleted > 0 {
            session.cache.invalidate();
            session.executor.reset().await;
        }
        Ok(report)
    }

    /// Drops every indexed row and starts over with an empty index under
    /// the same key.
    pub async fn delete_index(&self) -> EngineResult<()> {
        let mut session = self.session.write().await;
        self.teardown(&session).await?;
        *session = open_session(&self.user_id, &self.config, &self.stores, &self.collaborators).await?;
        Ok(())
    }

    /// Replaces the key. Rows encrypted under the old key would be unreadable,
    /// so the index goes with it.
    pub async fn rotate_key(&self) -> EngineResult<()> {
        let mut session = self.session.write().await;
        self.teardown(&session).await?;
        crypto::destroy_key(self.collaborators.secure_storage.as_ref(), &self.user_id)?;
        *session = open_session(&self.user_id, &self.config, &self.stores, &self.collaborators).await?;
        info!(user = %self.user_id, "Rotated search index key");
        Ok(())
    }

    /// User opt-out: removes the index and the key.
    pub async fn disable(self) -> EngineResult<()> {
        let session = self.session.write().await;
        self.teardown(&session).await?;
        crypto::destroy_key(self.collaborators.secure_storage.as_ref(), &self.user_id)?;
        info!(user = %self.user_id, "Encrypted search disabled");
        Ok(())
    }

    async fn teardown(&self, session: &Session) -> EngineResult<()> {
        session.builder.stop();
        session.builder.wait_until_settled().await;
        session.cache.invalidate();
        session.executor.reset().await;
        self.stores.delete_index(&self.user_id).await?;
        Ok(())
    }
}

async fn open_session(
    user_id: &str,
    config: &EngineConfig,
    stores: &IndexStores,
    collaborators: &Collaborators,
) -> EngineResult<Session> {
    let key = crypto::get_or_create_key(collaborators.secure_storage.as_ref(), user_id)?;
    let cipher = Arc::new(SearchCipher::new(&key));
    let store = stores.open(user_id).await?;
    let cache = Arc::new(CacheSlot::new());

    let builder = IndexBuilder::new(
        user_id,
        config.clone(),
        store.clone(),
        cipher.clone(),
        cache.clone(),
        collaborators,
    );
    let executor = SearchExecutor::new(
        store.clone(),
        cipher,
        cache.clone(),
        collaborators.memory.clone(),
        config.clone(),
    );

    Ok(Session {
        store,
        cache,
        builder,
        executor,
    })
}
