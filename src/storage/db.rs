use crate::errors::{store_err, EngineError, EngineResult};
use crate::storage::blob::BlobDir;
use crate::types::{
    join_labels, split_labels, EncryptedPayload, IndexedMessage, MessageUpdate, ScanCursor,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

const COLUMNS: &str = "message_id, time, msg_order, label_ids, location, has_body, \
     decryption_failed, encryption_iv, encrypted_content, encrypted_content_file, \
     encrypted_content_size";

const SCAN_ORDER: &str = "ORDER BY time DESC, msg_order DESC, message_id DESC";

#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Ciphertext longer than this goes to a blob file instead of the row.
    pub blob_threshold_bytes: usize,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            blob_threshold_bytes: 64 * 1024,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&crate::config::EngineConfig> for StoreOptions {
    fn from(config: &crate::config::EngineConfig) -> Self {
        Self {
            blob_threshold_bytes: config.blob_threshold_bytes,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShrinkReport {
    pub deleted: u64,
    pub size_bytes: u64,
}

/// Encrypted row store for one user. Every operation passes through a
/// single-permit gate, so reads and writes interleave but never overlap.
pub struct IndexStore {
    pool: SqlitePool,
    path: PathBuf,
    blobs: BlobDir,
    gate: Semaphore,
    options: StoreOptions,
}

impl IndexStore {
    pub async fn open(dir: &Path, user_id: &str, options: StoreOptions) -> EngineResult<Self> {
        std::fs::create_dir_all(dir).map_err(store_err("creating index directory"))?;
        let path = dir.join(super::index_file_name(user_id));

        let connect = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect)
            .await
            .map_err(|e| {
                EngineError::IndexStore(format!("connecting to sqlite at {}: {e}", path.display()))
            })?;

        let store = IndexStore {
            pool,
            blobs: BlobDir::new(dir.join(super::blob_dir_name(user_id))),
            path,
            gate: Semaphore::new(1),
            options,
        };
        store.migrate().await?;
        debug!(path = %store.path.display(), "Opened search index");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn lock(&self) -> EngineResult<SemaphorePermit<'_>> {
        self.gate
            .acquire()
            .await
            .map_err(store_err("acquiring index gate"))
    }

    async fn migrate(&self) -> EngineResult<()> {
        let _permit = self.lock().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS searchable_messages (
                message_id TEXT PRIMARY KEY,
                time INTEGER NOT NULL DEFAULT 0,
                msg_order INTEGER NOT NULL DEFAULT 0,
                label_ids TEXT NOT NULL DEFAULT '',
                location INTEGER NOT NULL DEFAULT 0,
                has_body INTEGER NOT NULL DEFAULT 0,
                decryption_failed INTEGER NOT NULL DEFAULT 0,
                encryption_iv TEXT,
                encrypted_content TEXT,
                encrypted_content_file TEXT,
                encrypted_content_size INTEGER NOT NULL DEFAULT -1
            );
            CREATE INDEX IF NOT EXISTS idx_searchable_scan
                ON searchable_messages(time DESC, msg_order DESC, message_id DESC);

            CREATE TABLE IF NOT EXISTS index_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err("running migrations"))?;
        Ok(())
    }

    /// Inserts the row, replacing any previous row for the same message.
    pub async fn insert(&self, row: &IndexedMessage) -> EngineResult<()> {
        let _permit = self.lock().await?;
        let (inline, file) = self.place_content(&row.message_id, row.encrypted_content.as_deref())?;

        let result = sqlx::query(
            r#"
            INSERT INTO searchable_messages (
                message_id, time, msg_order, label_ids, location, has_body,
                decryption_failed, encryption_iv, encrypted_content,
                encrypted_content_file, encrypted_content_size
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(message_id) DO UPDATE SET
                time = excluded.time,
                msg_order = excluded.msg_order,
                label_ids = excluded.label_ids,
                location = excluded.location,
                has_body = excluded.has_body,
                decryption_failed = excluded.decryption_failed,
                encryption_iv = excluded.encryption_iv,
                encrypted_content = excluded.encrypted_content,
                encrypted_content_file = excluded.encrypted_content_file,
                encrypted_content_size = excluded.encrypted_content_size;
            "#,
        )
        .bind(&row.message_id)
        .bind(row.timestamp)
        .bind(row.order)
        .bind(join_labels(&row.label_ids))
        .bind(row.location)
        .bind(if row.has_body { 1 } else { 0 })
        .bind(if row.decryption_failed { 1 } else { 0 })
        .bind(&row.encryption_iv)
        .bind(inline)
        .bind(&file)
        .bind(row.encrypted_content_size)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            if file.is_some() {
                let _ = self.blobs.remove(&row.message_id);
            }
            return Err(store_err("inserting row")(e));
        }
        Ok(())
    }

    /// Applies the given fields. Returns whether a row matched.
    pub async fn update(&self, message_id: &str, update: &MessageUpdate) -> EngineResult<bool> {
        if update.is_empty() {
            return self.contains(message_id).await;
        }

        let _permit = self.lock().await?;
        let placed = match &update.content {
            Some(payload) => Some((
                payload,
                self.place_content(message_id, Some(payload.ciphertext.as_str()))?,
            )),
            None => None,
        };

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE searchable_messages SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(ts) = update.timestamp {
                set.push("time = ");
                set.push_bind_unseparated(ts);
            }
            if let Some(order) = update.order {
                set.push("msg_order = ");
                set.push_bind_unseparated(order);
            }
            if let Some(labels) = &update.label_ids {
                set.push("label_ids = ");
                set.push_bind_unseparated(join_labels(labels));
            }
            if let Some(location) = update.location {
                set.push("location = ");
                set.push_bind_unseparated(location);
            }
            if let Some((payload, (inline, file))) = placed {
                let EncryptedPayload { iv, size, .. } = payload;
                set.push("has_body = 1");
                set.push("decryption_failed = 0");
                set.push("encryption_iv = ");
                set.push_bind_unseparated(iv.clone());
                set.push("encrypted_content = ");
                set.push_bind_unseparated(inline.map(str::to_string));
                set.push("encrypted_content_file = ");
                set.push_bind_unseparated(file);
                set.push("encrypted_content_size = ");
                set.push_bind_unseparated(*size);
            }
        }
        qb.push(" WHERE message_id = ");
        qb.push_bind(message_id);

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(store_err("updating row"))?;
        Ok(res.rows_affected() > 0)
    }

    /// Removes the row and its blob file. Returns whether a row existed.
    pub async fn delete(&self, message_id: &str) -> EngineResult<bool> {
        let _permit = self.lock().await?;
        let res = sqlx::query("DELETE FROM searchable_messages WHERE message_id = ?1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(store_err("deleting row"))?;
        self.blobs.remove(message_id)?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn count(&self) -> EngineResult<u64> {
        let _permit = self.lock().await?;
        let row = sqlx::query("SELECT COUNT(*) FROM searchable_messages")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err("counting rows"))?;
        Ok(row.get::<i64, _>(0).max(0) as u64)
    }

    pub async fn contains(&self, message_id: &str) -> EngineResult<bool> {
        let _permit = self.lock().await?;
        let row = sqlx::query("SELECT 1 FROM searchable_messages WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("checking row"))?;
        Ok(row.is_some())
    }

    pub async fn get(&self, message_id: &str) -> EngineResult<Option<IndexedMessage>> {
        let _permit = self.lock().await?;
        let sql = format!("SELECT {COLUMNS} FROM searchable_messages WHERE message_id = ?1");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("loading row"))?;
        Ok(row.map(|r| self.row_to_message(&r)))
    }

    /// `(message_id, timestamp)` of the oldest row.
    pub async fn oldest(&self) -> EngineResult<Option<(String, i64)>> {
        self.edge("ORDER BY time ASC, msg_order ASC, message_id ASC").await
    }

    /// `(message_id, timestamp)` of the newest row.
    pub async fn newest(&self) -> EngineResult<Option<(String, i64)>> {
        self.edge(SCAN_ORDER).await
    }

    pub async fn oldest_message_id(&self) -> EngineResult<Option<String>> {
        Ok(self.oldest().await?.map(|(id, _)| id))
    }

    pub async fn newest_message_id(&self) -> EngineResult<Option<String>> {
        Ok(self.newest().await?.map(|(id, _)| id))
    }

    async fn edge(&self, order: &str) -> EngineResult<Option<(String, i64)>> {
        let _permit = self.lock().await?;
        let sql = format!("SELECT message_id, time FROM searchable_messages {order} LIMIT 1");
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("loading edge row"))?;
        Ok(row.map(|r| (r.get::<String, _>(0), r.get::<i64, _>(1))))
    }

    /// Rows with `time >= since`, newest first.
    pub async fn messages_since(&self, since: i64) -> EngineResult<Vec<IndexedMessage>> {
        let _permit = self.lock().await?;
        let sql = format!("SELECT {COLUMNS} FROM searchable_messages WHERE time >= ?1 {SCAN_ORDER}");
        let rows = sqlx::query(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("loading messages since"))?;
        Ok(rows.iter().map(|r| self.row_to_message(r)).collect())
    }

    /// Keyset scan in newest-first order, starting strictly after `after`.
    pub async fn scan(
        &self,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> EngineResult<Vec<IndexedMessage>> {
        let _permit = self.lock().await?;
        let rows = match after {
            Some(cursor) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM searchable_messages \
                     WHERE (time, msg_order, message_id) < (?1, ?2, ?3) {SCAN_ORDER} LIMIT ?4"
                );
                sqlx::query(&sql)
                    .bind(cursor.timestamp)
                    .bind(cursor.order)
                    .bind(&cursor.message_id)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!("SELECT {COLUMNS} FROM searchable_messages {SCAN_ORDER} LIMIT ?1");
                sqlx::query(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(store_err("scanning rows"))?;

        Ok(rows.iter().map(|r| self.row_to_message(r)).collect())
    }

    pub async fn get_meta(&self, key: &str) -> EngineResult<Option<String>> {
        let _permit = self.lock().await?;
        let row = sqlx::query("SELECT value FROM index_metadata WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("loading metadata"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> EngineResult<()> {
        let _permit = self.lock().await?;
        sqlx::query(
            r#"
            INSERT INTO index_metadata (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err("saving metadata"))?;
        Ok(())
    }

    /// Bytes used by the database file, its WAL and the blob files.
    pub async fn size_on_disk(&self) -> EngineResult<u64> {
        let _permit = self.lock().await?;
        Ok(self.disk_usage())
    }

    /// Reclaims free pages and folds the WAL back into the main file.
    pub async fn compact(&self) -> EngineResult<()> {
        let _permit = self.lock().await?;
        self.vacuum_locked().await
    }

    /// Deletes oldest rows first, reclaiming space after each deletion, until
    /// the index fits in `target_bytes` or is empty.
    pub async fn shrink_to_fit(&self, target_bytes: u64) -> EngineResult<ShrinkReport> {
        let _permit = self.lock().await?;
        let mut deleted = 0u64;
        let mut size = self.disk_usage();

        while size > target_bytes {
            let oldest = sqlx::query(
                "SELECT message_id FROM searchable_messages \
                 ORDER BY time ASC, msg_order ASC, message_id ASC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("finding oldest row"))?;

            let Some(row) = oldest else {
                warn!(
                    path = %self.path.display(),
                    size_bytes = size,
                    target_bytes,
                    "Index is empty but still above the size target"
                );
                break;
            };
            let message_id: String = row.get(0);

            sqlx::query("DELETE FROM searchable_messages WHERE message_id = ?1")
                .bind(&message_id)
                .execute(&self.pool)
                .await
                .map_err(store_err("deleting oldest row"))?;
            self.blobs.remove(&message_id)?;
            deleted += 1;

            self.vacuum_locked().await?;
            size = self.disk_usage();
        }

        if deleted > 0 {
            info!(
                path = %self.path.display(),
                deleted,
                size_bytes = size,
                target_bytes,
                "Shrunk search index"
            );
        }
        Ok(ShrinkReport {
            deleted,
            size_bytes: size,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn vacuum_locked(&self) -> EngineResult<()> {
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(store_err("vacuuming index"))?;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(store_err("checkpointing wal"))?;
        Ok(())
    }

    fn disk_usage(&self) -> u64 {
        let file_len = |p: PathBuf| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
        file_len(self.path.clone())
            + file_len(super::sidecar_path(&self.path, "-wal"))
            + self.blobs.total_size()
    }

    /// Decides where ciphertext lives: inline in the row or in a blob file.
    fn place_content<'a>(
        &self,
        message_id: &str,
        ciphertext: Option<&'a str>,
    ) -> EngineResult<(Option<&'a str>, Option<String>)> {
        match ciphertext {
            Some(ct) if ct.len() > self.options.blob_threshold_bytes => {
                let file = self.blobs.write(message_id, ct)?;
                Ok((None, Some(file)))
            }
            other => {
                self.blobs.remove(message_id)?;
                Ok((other, None))
            }
        }
    }

    fn row_to_message(&self, row: &SqliteRow) -> IndexedMessage {
        let message_id: String = row.get("message_id");
        let file: Option<String> = row.get("encrypted_content_file");
        let mut content: Option<String> = row.get("encrypted_content");

        if content.is_none() {
            if let Some(name) = &file {
                match self.blobs.read(name) {
                    Ok(ct) => content = Some(ct),
                    Err(e) => {
                        warn!(message_id = %message_id, error = %e, "Blob file unreadable; row kept without content")
                    }
                }
            }
        }

        IndexedMessage {
            message_id,
            timestamp: row.get("time"),
            order: row.get("msg_order"),
            label_ids: split_labels(&row.get::<String, _>("label_ids")),
            location: row.get("location"),
            has_body: row.get::<i64, _>("has_body") == 1,
            decryption_failed: row.get::<i64, _>("decryption_failed") == 1,
            encryption_iv: row.get("encryption_iv"),
            encrypted_content: content,
            encrypted_content_file: file,
            encrypted_content_size: row.get("encrypted_content_size"),
        }
    }
}
