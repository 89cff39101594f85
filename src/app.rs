use crate::cache::CacheSlot;
use crate::cli::{Cli, Command};
use crate::config::EngineConfig;
use crate::crypto::{self, KeyringStorage, SearchCipher};
use crate::indexer::{LAST_BUILT_KEY, WATERMARK_KEY};
use crate::memory::SystemMemory;
use crate::search::SearchExecutor;
use crate::storage::{format_bytes, format_index_date, index_file_name, IndexStore, IndexStores, StoreOptions};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load()?;
    let dir = config.resolve_data_dir()?;
    let stores = IndexStores::new(dir.clone(), StoreOptions::from(&config));
    info!(path = %dir.display(), "Using index directory");

    if let Command::Delete = cli.command {
        let removed = stores.delete_index(&cli.user).await?;
        if removed {
            println!("Deleted search index for {}", cli.user);
        } else {
            println!("No search index for {}", cli.user);
        }
        return Ok(());
    }

    if !dir.join(index_file_name(&cli.user)).exists() {
        warn!(user = %cli.user, "No index on disk");
        println!("No search index for {}", cli.user);
        return Ok(());
    }

    let store = stores.open(&cli.user).await?;
    let result = match cli.command {
        Command::Status => print_status(&store).await,
        Command::Search { query, page } => {
            run_search(&cli.user, &config, store.clone(), &query, page).await
        }
        Command::Compact => {
            let before = store.size_on_disk().await?;
            store.compact().await?;
            let after = store.size_on_disk().await?;
            println!("Compacted: {} -> {}", format_bytes(before), format_bytes(after));
            Ok(())
        }
        Command::Shrink { target_bytes } => {
            let report = store.shrink_to_fit(target_bytes).await?;
            println!(
                "Removed {} oldest messages; index is now {}",
                report.deleted,
                format_bytes(report.size_bytes)
            );
            Ok(())
        }
        Command::Delete => Ok(()),
    };

    stores.close_all().await;
    result
}

async fn print_status(store: &IndexStore) -> Result<()> {
    let count = store.count().await?;
    let size = store.size_on_disk().await?;
    let oldest = store.oldest().await?;
    let newest = store.newest().await?;
    let watermark = store.get_meta(WATERMARK_KEY).await?;
    let last_built = store.get_meta(LAST_BUILT_KEY).await?;

    println!("\n{}", "=".repeat(60));
    println!("Search index: {}", store.path().display());
    println!("{}\n", "=".repeat(60));
    println!("Messages:   {count}");
    println!("Size:       {}", format_bytes(size));

    if let Some((id, ts)) = oldest {
        let date = format_index_date(ts).unwrap_or_else(|| "Unknown".to_string());
        println!("Oldest:     {date} ({id})");
    }
    if let Some((id, ts)) = newest {
        let date = DateTime::<Utc>::from_timestamp(ts, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        println!("Newest:     {date} ({id})");
    }
    if let Some(raw) = watermark {
        println!("Watermark:  {raw}");
    }
    if let Some(built) = last_built.and_then(|raw| raw.parse::<i64>().ok()) {
        let date = DateTime::<Utc>::from_timestamp(built, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        println!("Last build: {date}");
    }
    println!();
    Ok(())
}

async fn run_search(
    user_id: &str,
    config: &EngineConfig,
    store: Arc<IndexStore>,
    query: &str,
    page: usize,
) -> Result<()> {
    let key = crypto::load_key(&KeyringStorage, user_id)?
        .with_context(|| format!("no search key for {user_id} in the keyring"))?;

    let executor = SearchExecutor::new(
        store,
        Arc::new(SearchCipher::new(&key)),
        Arc::new(CacheSlot::new()),
        Arc::new(SystemMemory::new()),
        config.clone(),
    );
    let results = executor.search(query, page).await?;

    if results.is_empty() {
        println!("No results for \"{query}\" (page {page})");
        return Ok(());
    }

    for (i, found) in results.iter().enumerate() {
        let date = DateTime::<Utc>::from_timestamp(found.timestamp, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let labels = found
            .label_ids
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{}. [{}] {}  labels: {}",
            page * config.page_size + i + 1,
            date,
            found.message_id,
            labels
        );
    }
    Ok(())
}
