pub mod connection;
pub mod dispatcher;
pub mod permissions;
pub mod pipeline;
pub mod receipts;
pub mod rooms;
pub mod typing;

pub use dispatcher::Dispatcher;
pub use permissions::{GroupBlockPolicy, PermissionGate};
pub use rooms::{RoomKey, RoomRegistry, SESSION_QUEUE_CAPACITY};
pub use typing::{TYPING_TTL, TypingTracker};

use std::sync::Arc;

use tracing::error;

use sidebar_store::Database;
use sidebar_types::DmError;

/// Run a blocking store call off the async runtime. Store failures are
/// logged here and surface to the caller as a retryable error.
pub(crate) async fn with_store<T, F>(store: &Arc<Database>, f: F) -> Result<T, DmError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> sidebar_store::Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| {
            error!("store task join error: {e}");
            DmError::transient("message store unavailable")
        })?
        .map_err(|e| {
            error!("store error: {e}");
            DmError::transient("message store unavailable")
        })
}
