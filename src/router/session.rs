//! Session-facing types: event channel, handle, registration future.
//!
//! Each logical session owns a dedicated event channel. The router holds the
//! sending half and releases it when the session ends, so notifications are
//! ownership-tagged rather than going through a shared callback registry.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::SessionRouter;
use crate::error::{LinkError, Result};
use crate::protocol::ServiceType;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Ended locally and confirmed by the peer, or the link was stopped.
    Closed,
    /// The peer sent END_SESSION.
    PeerRequested,
    /// The physical transport died.
    ConnectionLost,
}

/// What a session owner receives on its event channel.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete inbound message (SINGLE frame or finished reassembly).
    Packet {
        service_type: ServiceType,
        payload: Bytes,
    },
    /// The session is gone. Delivered exactly once, last.
    Ended { reason: EndReason },
}

/// Owner-side handle to an ACTIVE session.
///
/// Dropping the handle does not end the session on the wire; use
/// [`SessionHandle::end`] for an orderly shutdown.
pub struct SessionHandle {
    pub(crate) session_id: u8,
    pub(crate) events: mpsc::Receiver<SessionEvent>,
    pub(crate) router: Arc<SessionRouter>,
}

impl SessionHandle {
    /// The peer-assigned session id.
    #[inline]
    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    /// Receive the next event, in wire arrival order. `None` after the
    /// session has ended and the final event was consumed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Submit a message on this session. See [`SessionRouter::send`].
    pub async fn send(&self, service_type: ServiceType, payload: Bytes) -> Result<()> {
        self.router.send(self.session_id, service_type, payload).await
    }

    /// Start an additional service type on this session.
    pub async fn add_service(&self, service_type: ServiceType) -> Result<()> {
        self.router.add_service(self.session_id, service_type).await
    }

    /// End one service on this session; resolves on the peer's
    /// END_SESSION_ACK.
    pub async fn end(&self, service_type: ServiceType) -> Result<()> {
        self.router.end_session(self.session_id, service_type).await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// An outstanding START_SESSION request.
///
/// Resolves when the peer answers with START_SESSION_ACK (yielding the
/// session handle) or START_SESSION_NACK (`RegistrationRefused`).
#[derive(Debug)]
pub struct PendingRegistration {
    pub(crate) rx: oneshot::Receiver<Result<SessionHandle>>,
}

impl PendingRegistration {
    /// Wait for the peer's answer.
    pub async fn wait(self) -> Result<SessionHandle> {
        self.rx.await.map_err(|_| LinkError::ConnectionClosed)?
    }
}
