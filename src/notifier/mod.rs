pub mod bot;
pub mod monitoring;

pub use bot::{Notifier, DEFAULT_CHUNK_SIZE};
pub use monitoring::Monitoring;
