use clap::{Parser, Subcommand};

/// Command-line options for sealsearch.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// User whose index to operate on.
    #[arg(long)]
    pub user: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show row count, size and date range of the index.
    Status,
    /// Run a keyword search against the index.
    Search {
        query: String,
        /// Zero-based result page.
        #[arg(long, default_value_t = 0)]
        page: usize,
    },
    /// Reclaim free pages and truncate the WAL.
    Compact,
    /// Delete oldest rows until the index fits in the given size.
    Shrink {
        #[arg(long)]
        target_bytes: u64,
    },
    /// Remove the index files for the user.
    Delete,
}
