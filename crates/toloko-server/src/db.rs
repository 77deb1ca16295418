//! Async access to the synchronous store.
//!
//! The single `rusqlite` connection sits behind a mutex and every call runs
//! on the blocking thread pool, so a closure passed to [`Db::run`] observes
//! and mutates the database without interleaving with any other call.

use std::sync::Arc;

use parking_lot::Mutex;
use toloko_store::Database;

use crate::error::ServerError;

#[derive(Clone)]
pub struct Db {
    inner: Arc<Mutex<Database>>,
}

impl Db {
    pub fn new(database: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(database)),
        }
    }

    /// Run `f` against the database on a blocking thread.
    pub async fn run<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let db = inner.lock();
            f(&db)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("database task failed: {e}")))?
    }
}
