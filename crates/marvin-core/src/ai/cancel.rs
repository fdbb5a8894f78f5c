use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Cancels one chat request.
///
/// Created before the request is dispatched and passed along with it. Clones
/// share the same underlying token.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    id: u64,
    token: CancellationToken,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}
