//! Engine status codes and client completion tokens.

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::oneshot;

/// Engine-visible outcome of a command.
///
/// No stack unwinding leaves the core: every operation resolves to one
/// of these codes. `WouldBlock` is not an error; it is the contract
/// for "the engine has accepted responsibility; the cookie will be
/// notified with the final status".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum Status {
    #[error("success")]
    Success,
    #[error("key-not-found")]
    KeyNotFound,
    #[error("key-exists")]
    KeyExists,
    #[error("not-my-vbucket")]
    NotMyVbucket,
    #[error("would-block")]
    WouldBlock,
    #[error("temporary-failure")]
    TemporaryFailure,
    #[error("no-memory")]
    NoMemory,
    #[error("locked")]
    Locked,
    #[error("locked-temporary-failure")]
    LockedTemporaryFailure,
    #[error("e2big")]
    TooBig,
    #[error("einval")]
    InvalidArguments,
    #[error("unknown-collection")]
    UnknownCollection,
    #[error("collections-manifest-ahead")]
    CollectionsManifestAhead,
    #[error("rollback-required")]
    RollbackRequired,
    #[error("sync-write-in-progress")]
    SyncWriteInProgress,
    #[error("sync-write-ambiguous")]
    SyncWriteAmbiguous,
    #[error("durability-impossible")]
    DurabilityImpossible,
    #[error("dcp-stream-id-invalid")]
    StreamIdInvalid,
    #[error("disconnect")]
    Disconnect,
}

impl Status {
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Success | Status::WouldBlock)
    }

    /// Remaps extended codes for clients that have not negotiated them.
    ///
    /// The remap is a whitelist: codes a legacy client understands pass
    /// through unchanged, the synchronous-write family collapses onto
    /// `temporary-failure` (retryable from the client's point of view).
    pub fn remap_for_basic_client(self) -> Status {
        match self {
            Status::SyncWriteInProgress
            | Status::SyncWriteAmbiguous
            | Status::DurabilityImpossible
            | Status::CollectionsManifestAhead => Status::TemporaryFailure,
            other => other,
        }
    }
}

struct CookieInner {
    tx: Mutex<Option<oneshot::Sender<Status>>>,
}

/// Opaque per-client token used to deliver an asynchronous result.
///
/// Cloneable so it can be parked in a pending-op queue and tracked by
/// the durability monitor at the same time; the underlying channel
/// fires at most once no matter how many clones attempt delivery.
#[derive(Clone)]
pub struct ClientCookie {
    inner: Arc<CookieInner>,
}

impl ClientCookie {
    pub fn new() -> (Self, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Arc::new(CookieInner {
                    tx: Mutex::new(Some(tx)),
                }),
            },
            CompletionHandle { rx },
        )
    }

    /// Delivers the final status. Returns false when the cookie has
    /// already been notified (the first delivery wins).
    pub fn notify(&self, status: Status) -> bool {
        let Ok(mut tx) = self.inner.tx.lock() else {
            return false;
        };
        match tx.take() {
            Some(tx) => tx.send(status).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for ClientCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delivered = self
            .inner
            .tx
            .lock()
            .map(|tx| tx.is_none())
            .unwrap_or(true);
        f.debug_struct("ClientCookie")
            .field("delivered", &delivered)
            .finish()
    }
}

/// Receiving side of a [`ClientCookie`].
pub struct CompletionHandle {
    rx: oneshot::Receiver<Status>,
}

impl CompletionHandle {
    /// Non-blocking poll for the delivered status.
    pub fn try_status(&mut self) -> Option<Status> {
        self.rx.try_recv().ok()
    }

    /// Blocks until the status is delivered. Returns `None` when every
    /// clone of the cookie was dropped without a delivery.
    pub fn wait(self) -> Option<Status> {
        self.rx.blocking_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_delivers_exactly_once() {
        let (cookie, mut handle) = ClientCookie::new();
        let second = cookie.clone();

        assert!(cookie.notify(Status::Success));
        assert!(!second.notify(Status::TemporaryFailure));
        assert_eq!(Some(Status::Success), handle.try_status());
    }

    #[test]
    fn dropping_all_cookies_resolves_the_handle() {
        let (cookie, handle) = ClientCookie::new();
        drop(cookie);
        assert_eq!(None, handle.wait());
    }

    #[test]
    fn basic_client_remap_collapses_sync_write_codes() {
        assert_eq!(
            Status::TemporaryFailure,
            Status::SyncWriteInProgress.remap_for_basic_client()
        );
        assert_eq!(
            Status::TemporaryFailure,
            Status::SyncWriteAmbiguous.remap_for_basic_client()
        );
        assert_eq!(
            Status::KeyNotFound,
            Status::KeyNotFound.remap_for_basic_client()
        );
    }

    #[test]
    fn would_block_is_not_an_error() {
        assert!(!Status::WouldBlock.is_error());
        assert!(!Status::Success.is_error());
        assert!(Status::KeyExists.is_error());
    }
}
