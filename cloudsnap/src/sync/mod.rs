pub mod crypto;
pub mod engine;
pub mod glob;
pub mod record;
pub mod timetravel;
pub mod watcher;
