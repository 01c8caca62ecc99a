//! One-shot holder for a caller's response callback.

use lanlink_core::{P2PError, P2PResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce(P2PResponse) + Send>;

/// Must be consumed by [`ResponseSlot::resolve`] or [`ResponseSlot::fail`].
/// Dropping it unconsumed still invokes the callback: with `Closed` when the
/// socket is shutting down, otherwise with `Cancelled`.
#[must_use = "a response slot must be resolved"]
pub(crate) struct ResponseSlot {
    callback: Option<Callback>,
    shutdown: CancellationToken,
}

impl ResponseSlot {
    pub(crate) fn new(
        callback: impl FnOnce(P2PResponse) + Send + 'static,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            shutdown,
        }
    }

    pub(crate) fn resolve(mut self, response: P2PResponse) {
        if let Some(cb) = self.callback.take() {
            cb(response);
        }
    }

    pub(crate) fn fail(self, error: P2PError) {
        self.resolve(P2PResponse::err(error));
    }
}

impl Drop for ResponseSlot {
    fn drop(&mut self) {
        if let Some(cb) = self.callback.take() {
            if self.shutdown.is_cancelled() {
                debug!("request dropped during shutdown");
                cb(P2PResponse::err(P2PError::Closed));
            } else {
                warn!("request dropped without a response");
                cb(P2PResponse::err(P2PError::Cancelled));
            }
        }
    }
}
