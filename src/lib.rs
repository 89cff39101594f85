pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod errors;
pub mod indexer;
pub mod mailbox;
pub mod memory;
pub mod sanitize;
pub mod search;
pub mod storage;
pub mod types;

pub use engine::{Collaborators, SearchEngine};
pub use errors::{EngineError, EngineResult};
