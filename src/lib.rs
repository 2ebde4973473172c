pub mod db;
pub mod epoch;
pub mod error;
pub mod logs;
pub mod matching;
pub mod notify;
pub mod profile;
pub mod relink;
pub mod scheduler;
pub mod thresholds;

use std::sync::Arc;

pub type SharedStore = Arc<db::KeyStore>;

/// Run a blocking store operation on tokio's blocking thread pool.
///
/// All synchronous KeyStore calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn db_call<F, T>(store: &SharedStore, f: F) -> Result<T, error::LedgerError>
where
    F: FnOnce(&db::KeyStore) -> Result<T, error::LedgerError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| error::LedgerError::Internal(e.to_string()))?
}
