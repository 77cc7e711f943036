mod sqlite;

use crate::models::Session;

pub use sqlite::{SqliteHistory, StoredDetection};

/// Append-only store of finished sessions
pub trait HistorySink: Send + Sync {
    fn record_session(&self, session: &Session) -> impl Future<Output = anyhow::Result<()>> + Send;
}
