//! Session router / multiplexer.
//!
//! The router is the single point of truth for which logical session owns
//! which session id, and the only component permitted to submit writes to the
//! transport pump. Inbound packets arrive from the pump's event channel and
//! are fanned out to per-session event channels; outbound submissions are
//! encoded, tagged with a strictly increasing sequence number, and appended
//! to the single write FIFO.
//!
//! All session-table and reassembly mutation happens behind one mutex, since
//! both the dispatch task (inbound control/data) and application callers
//! (registration/send) touch that state concurrently. Enqueuing to the pump
//! goes through a separate async lock so a multi-frame train is never split
//! by another session's packet.

mod reassembly;
mod session;

pub use session::{EndReason, PendingRegistration, SessionEvent, SessionHandle};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::{LinkError, Result};
use crate::protocol::{
    control, parse_first_frame_payload, FrameType, Packet, PacketCodec, ServiceType,
};
use crate::pump::{PendingWrite, PumpEvent, WriteQueue};
use reassembly::{ReassemblyBuffer, ReassemblyKey};

/// Default capacity of each session's inbound event channel.
pub const DEFAULT_SESSION_CHANNEL_CAPACITY: usize = 64;

/// Counters for events worth watching but not worth failing on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Data packets dropped for lack of an ACTIVE (session, service) mapping.
    pub orphan_drops: u64,
    /// Fragment trains discarded for ordering/length violations.
    pub reassembly_failures: u64,
    /// HEARTBEAT probes answered on behalf of clients.
    pub heartbeats_answered: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    orphan_drops: AtomicU64,
    reassembly_failures: AtomicU64,
    heartbeats_answered: AtomicU64,
}

/// Per-service lifecycle inside a bound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Active,
    /// END_SESSION sent, awaiting the peer's END_SESSION_ACK.
    Ending,
}

/// A session id bound by the peer, with its owner's event channel.
struct SessionEntry {
    events: mpsc::Sender<SessionEvent>,
    services: HashMap<ServiceType, ServiceState>,
    next_message_id: u32,
}

/// A START_SESSION for a brand new session (requested with id 0).
struct PendingNew {
    service_type: ServiceType,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    reply: oneshot::Sender<Result<SessionHandle>>,
}

/// A START_SESSION adding a service to an existing session.
struct PendingService {
    session_id: u8,
    service_type: ServiceType,
    reply: oneshot::Sender<Result<()>>,
}

/// A locally initiated END_SESSION awaiting confirmation.
struct PendingEnd {
    session_id: u8,
    service_type: ServiceType,
    reply: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct RouterState {
    sessions: HashMap<u8, SessionEntry>,
    pending_new: VecDeque<PendingNew>,
    pending_service: Vec<PendingService>,
    pending_end: Vec<PendingEnd>,
    reassembly: HashMap<ReassemblyKey, ReassemblyBuffer>,
}

/// Multiplexes logical sessions onto one physical transport.
pub struct SessionRouter {
    codec: PacketCodec,
    queue: AsyncMutex<WriteQueue>,
    state: Mutex<RouterState>,
    seq: AtomicU64,
    session_channel_capacity: usize,
    stats: StatCounters,
    self_weak: Weak<SessionRouter>,
}

impl SessionRouter {
    /// Create a router that writes through `queue` with the given codec.
    pub fn new(
        codec: PacketCodec,
        queue: WriteQueue,
        session_channel_capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            codec,
            queue: AsyncMutex::new(queue),
            state: Mutex::new(RouterState::default()),
            seq: AtomicU64::new(0),
            session_channel_capacity,
            stats: StatCounters::default(),
            self_weak: weak.clone(),
        })
    }

    /// Consume pump events until the connection goes away.
    ///
    /// On [`PumpEvent::Disconnected`] every ACTIVE session is torn down with
    /// [`EndReason::ConnectionLost`]; a clean channel close (caller-initiated
    /// stop) tears down with [`EndReason::Closed`] instead.
    pub fn spawn_dispatch(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PumpEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(PumpEvent::Packet(packet)) => self.handle_packet(packet).await,
                    Some(PumpEvent::Disconnected) => {
                        self.teardown(EndReason::ConnectionLost).await;
                        return;
                    }
                    None => {
                        self.teardown(EndReason::Closed).await;
                        return;
                    }
                }
            }
        })
    }

    /// Snapshot of drop/violation counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            orphan_drops: self.stats.orphan_drops.load(Ordering::Relaxed),
            reassembly_failures: self.stats.reassembly_failures.load(Ordering::Relaxed),
            heartbeats_answered: self.stats.heartbeats_answered.load(Ordering::Relaxed),
        }
    }

    /// Request a new session for `service_type`.
    ///
    /// Enqueues START_SESSION with session id 0 ("assign one"). The returned
    /// handle resolves when the peer answers.
    pub async fn register(&self, service_type: ServiceType) -> Result<PendingRegistration> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::channel(self.session_channel_capacity);

        {
            let mut state = self.state.lock().expect("router state poisoned");
            state.pending_new.push_back(PendingNew {
                service_type,
                event_tx,
                event_rx: Some(event_rx),
                reply: reply_tx,
            });
        }

        if let Err(e) = self.enqueue_control(0, service_type, control::START_SESSION).await {
            let mut state = self.state.lock().expect("router state poisoned");
            if let Some(pos) = state
                .pending_new
                .iter()
                .rposition(|p| p.service_type == service_type)
            {
                state.pending_new.remove(pos);
            }
            return Err(e);
        }

        Ok(PendingRegistration { rx: reply_rx })
    }

    /// Start an additional service type on an already-bound session.
    pub async fn add_service(&self, session_id: u8, service_type: ServiceType) -> Result<()> {
        let reply_rx = {
            let mut state = self.state.lock().expect("router state poisoned");
            let entry = state
                .sessions
                .get(&session_id)
                .ok_or(LinkError::SessionNotActive(session_id))?;
            if entry.services.contains_key(&service_type) {
                return Err(LinkError::Protocol(format!(
                    "service {service_type:?} already started on session {session_id}"
                )));
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending_service.push(PendingService {
                session_id,
                service_type,
                reply: reply_tx,
            });
            reply_rx
        };

        self.enqueue_control(session_id, service_type, control::START_SESSION)
            .await?;
        reply_rx.await.map_err(|_| LinkError::ConnectionClosed)?
    }

    /// Submit a message on an ACTIVE session.
    ///
    /// Rejected synchronously with [`LinkError::SessionNotActive`] otherwise.
    /// Frames of one submission hit the wire contiguously and in order.
    pub async fn send(
        &self,
        session_id: u8,
        service_type: ServiceType,
        payload: Bytes,
    ) -> Result<()> {
        let message_id = {
            let mut state = self.state.lock().expect("router state poisoned");
            let entry = state
                .sessions
                .get_mut(&session_id)
                .ok_or(LinkError::SessionNotActive(session_id))?;
            if entry.services.get(&service_type) != Some(&ServiceState::Active) {
                return Err(LinkError::SessionNotActive(session_id));
            }
            let id = entry.next_message_id;
            entry.next_message_id = id.wrapping_add(1);
            id
        };

        let packets = self
            .codec
            .encode_message(session_id, service_type, message_id, payload);

        // Hold the queue lock across the whole train: a fragmented transfer
        // reserves the writer until its final CONSECUTIVE frame is enqueued.
        let queue = self.queue.lock().await;
        for packet in packets {
            queue
                .submit(PendingWrite {
                    session_id,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                    bytes: Bytes::from(packet.encode_bytes()),
                })
                .await?;
        }
        Ok(())
    }

    /// End one service on a session; resolves on END_SESSION_ACK.
    pub async fn end_session(&self, session_id: u8, service_type: ServiceType) -> Result<()> {
        let reply_rx = {
            let mut state = self.state.lock().expect("router state poisoned");
            let entry = state
                .sessions
                .get_mut(&session_id)
                .ok_or(LinkError::SessionNotActive(session_id))?;
            match entry.services.get_mut(&service_type) {
                Some(s @ ServiceState::Active) => *s = ServiceState::Ending,
                _ => return Err(LinkError::SessionNotActive(session_id)),
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending_end.push(PendingEnd {
                session_id,
                service_type,
                reply: reply_tx,
            });
            reply_rx
        };

        self.enqueue_control(session_id, service_type, control::END_SESSION)
            .await?;
        reply_rx.await.map_err(|_| LinkError::ConnectionClosed)?
    }

    async fn handle_packet(&self, packet: Packet) {
        match packet.frame_type() {
            FrameType::Control => self.handle_control(packet).await,
            FrameType::Single => {
                self.deliver(packet.session_id(), packet.service_type(), packet.payload_bytes())
                    .await;
            }
            FrameType::First => self.begin_reassembly(&packet),
            FrameType::Consecutive => {
                if let Some(payload) = self.continue_reassembly(&packet) {
                    self.deliver(packet.session_id(), packet.service_type(), payload)
                        .await;
                }
            }
        }
    }

    /// Deliver a complete inbound payload to its session owner, or drop and
    /// report it as an orphan.
    async fn deliver(&self, session_id: u8, service_type: ServiceType, payload: Bytes) {
        let tx = {
            let state = self.state.lock().expect("router state poisoned");
            state.sessions.get(&session_id).and_then(|entry| {
                (entry.services.get(&service_type) == Some(&ServiceState::Active))
                    .then(|| entry.events.clone())
            })
        };

        match tx {
            Some(tx) => {
                if tx
                    .send(SessionEvent::Packet {
                        service_type,
                        payload,
                    })
                    .await
                    .is_err()
                {
                    self.stats.orphan_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "Session {} ({:?}) owner gone, packet dropped",
                        session_id,
                        service_type
                    );
                }
            }
            None => {
                self.stats.orphan_drops.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Dropping data packet for session {} ({:?}): no active session",
                    session_id,
                    service_type
                );
            }
        }
    }

    fn begin_reassembly(&self, packet: &Packet) {
        let declared = parse_first_frame_payload(packet.payload());
        let buffer = declared.and_then(|(total, count)| {
            ReassemblyBuffer::start(total, count)
                .map_err(|reason| {
                    tracing::warn!(
                        "Rejecting FIRST frame on session {} (message {}): {}",
                        packet.session_id(),
                        packet.message_id(),
                        reason
                    );
                })
                .ok()
        });

        let Some(buffer) = buffer else {
            self.stats.reassembly_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let key = ReassemblyKey {
            session_id: packet.session_id(),
            service_type: packet.service_type(),
            message_id: packet.message_id(),
        };
        let mut state = self.state.lock().expect("router state poisoned");
        if state.reassembly.insert(key, buffer).is_some() {
            // A FIRST frame restarting an in-flight transfer abandons the old one.
            self.stats.reassembly_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "FIRST frame restarted an in-progress reassembly on session {} (message {})",
                packet.session_id(),
                packet.message_id()
            );
        }
    }

    fn continue_reassembly(&self, packet: &Packet) -> Option<Bytes> {
        let key = ReassemblyKey {
            session_id: packet.session_id(),
            service_type: packet.service_type(),
            message_id: packet.message_id(),
        };
        let mut state = self.state.lock().expect("router state poisoned");
        let Some(buffer) = state.reassembly.get_mut(&key) else {
            drop(state);
            self.stats.reassembly_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "CONSECUTIVE frame without a matching FIRST on session {} (message {})",
                packet.session_id(),
                packet.message_id()
            );
            return None;
        };

        match buffer.push(packet.frame_info(), packet.payload()) {
            Ok(Some(payload)) => {
                state.reassembly.remove(&key);
                Some(payload)
            }
            Ok(None) => None,
            Err(reason) => {
                state.reassembly.remove(&key);
                drop(state);
                self.stats.reassembly_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Discarding reassembly on session {} (message {}): {}",
                    packet.session_id(),
                    packet.message_id(),
                    reason
                );
                None
            }
        }
    }

    async fn handle_control(&self, packet: Packet) {
        let session_id = packet.session_id();
        let service_type = packet.service_type();
        match packet.frame_info() {
            control::START_SESSION_ACK => self.on_start_ack(session_id, service_type),
            control::START_SESSION_NACK => self.on_start_nack(session_id, service_type),
            control::END_SESSION => self.on_peer_end(session_id, service_type).await,
            control::END_SESSION_ACK => self.on_end_ack(session_id, service_type).await,
            control::HEARTBEAT => {
                self.stats.heartbeats_answered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Answering heartbeat on session {}", session_id);
                if let Err(e) = self
                    .enqueue_control(session_id, ServiceType::Control, control::HEARTBEAT_ACK)
                    .await
                {
                    tracing::warn!("Failed to answer heartbeat: {}", e);
                }
            }
            control::HEARTBEAT_ACK => {
                tracing::trace!("Heartbeat acknowledged by peer on session {}", session_id);
            }
            info => {
                tracing::warn!(
                    "Unhandled control frame 0x{:02X} on session {}",
                    info,
                    session_id
                );
            }
        }
    }

    fn on_start_ack(&self, session_id: u8, service_type: ServiceType) {
        let mut state = self.state.lock().expect("router state poisoned");

        // Additional service on an existing session?
        if let Some(pos) = state
            .pending_service
            .iter()
            .position(|p| p.session_id == session_id && p.service_type == service_type)
        {
            let pending = state.pending_service.remove(pos);
            let result = match state.sessions.get_mut(&session_id) {
                Some(entry) => {
                    entry.services.insert(service_type, ServiceState::Active);
                    Ok(())
                }
                None => Err(LinkError::SessionNotActive(session_id)),
            };
            let _ = pending.reply.send(result);
            return;
        }

        // Otherwise the oldest new-session request for this service type.
        let Some(pos) = state
            .pending_new
            .iter()
            .position(|p| p.service_type == service_type)
        else {
            tracing::warn!(
                "Unmatched START_SESSION_ACK for session {} ({:?})",
                session_id,
                service_type
            );
            return;
        };
        let mut pending = state
            .pending_new
            .remove(pos)
            .expect("position found above");

        if session_id == 0 || state.sessions.contains_key(&session_id) {
            tracing::warn!("Peer assigned an unusable session id {}", session_id);
            let _ = pending.reply.send(Err(LinkError::Protocol(format!(
                "peer assigned unusable session id {session_id}"
            ))));
            return;
        }

        let mut services = HashMap::new();
        services.insert(service_type, ServiceState::Active);
        state.sessions.insert(
            session_id,
            SessionEntry {
                events: pending.event_tx.clone(),
                services,
                next_message_id: 1,
            },
        );

        let Some(router) = self.self_weak.upgrade() else {
            return;
        };
        let Some(events) = pending.event_rx.take() else {
            return;
        };
        tracing::debug!("Session {} started ({:?})", session_id, service_type);
        let _ = pending.reply.send(Ok(SessionHandle {
            session_id,
            events,
            router,
        }));
    }

    fn on_start_nack(&self, session_id: u8, service_type: ServiceType) {
        let mut state = self.state.lock().expect("router state poisoned");

        if let Some(pos) = state
            .pending_service
            .iter()
            .position(|p| p.session_id == session_id && p.service_type == service_type)
        {
            let pending = state.pending_service.remove(pos);
            let _ = pending.reply.send(Err(LinkError::RegistrationRefused));
            return;
        }

        if let Some(pos) = state
            .pending_new
            .iter()
            .position(|p| p.service_type == service_type)
        {
            if let Some(pending) = state.pending_new.remove(pos) {
                tracing::debug!("Registration refused by peer ({:?})", service_type);
                let _ = pending.reply.send(Err(LinkError::RegistrationRefused));
            }
            return;
        }

        tracing::warn!(
            "Unmatched START_SESSION_NACK for session {} ({:?})",
            session_id,
            service_type
        );
    }

    /// Peer-initiated END_SESSION: acknowledge, then end the service locally.
    async fn on_peer_end(&self, session_id: u8, service_type: ServiceType) {
        let notify = self.remove_service(session_id, service_type);

        if let Err(e) = self
            .enqueue_control(session_id, service_type, control::END_SESSION_ACK)
            .await
        {
            tracing::warn!("Failed to acknowledge END_SESSION: {}", e);
        }
        if let Some(tx) = notify {
            let _ = tx
                .send(SessionEvent::Ended {
                    reason: EndReason::PeerRequested,
                })
                .await;
        }
    }

    /// Peer confirmed a locally initiated end; the id is released here.
    async fn on_end_ack(&self, session_id: u8, service_type: ServiceType) {
        let notify = self.remove_service(session_id, service_type);
        if let Some(tx) = notify {
            let _ = tx
                .send(SessionEvent::Ended {
                    reason: EndReason::Closed,
                })
                .await;
        }
    }

    /// Drop one service from a session, resolving any matching pending end
    /// request. Returns the owner's event channel when the last service went
    /// away and the session was released.
    fn remove_service(
        &self,
        session_id: u8,
        service_type: ServiceType,
    ) -> Option<mpsc::Sender<SessionEvent>> {
        let mut state = self.state.lock().expect("router state poisoned");

        if let Some(pos) = state
            .pending_end
            .iter()
            .position(|p| p.session_id == session_id && p.service_type == service_type)
        {
            let pending = state.pending_end.remove(pos);
            let _ = pending.reply.send(Ok(()));
        }

        state
            .reassembly
            .retain(|key, _| !(key.session_id == session_id && key.service_type == service_type));

        let entry = state.sessions.get_mut(&session_id)?;
        if entry.services.remove(&service_type).is_none() {
            tracing::warn!(
                "End for a service that was not started on session {} ({:?})",
                session_id,
                service_type
            );
        }
        if entry.services.is_empty() {
            let entry = state
                .sessions
                .remove(&session_id)
                .expect("entry fetched above");
            tracing::debug!("Session {} ended, id released", session_id);
            return Some(entry.events);
        }
        None
    }

    /// End every session and fail every pending request. Each owner is
    /// notified exactly once; reassembly state and pending writes are gone
    /// afterwards.
    async fn teardown(&self, reason: EndReason) {
        let (owners, news, services, ends) = {
            let mut state = self.state.lock().expect("router state poisoned");
            let owners: Vec<_> = state.sessions.drain().map(|(_, e)| e.events).collect();
            let news: Vec<_> = state.pending_new.drain(..).collect();
            let services: Vec<_> = state.pending_service.drain(..).collect();
            let ends: Vec<_> = state.pending_end.drain(..).collect();
            state.reassembly.clear();
            (owners, news, services, ends)
        };

        tracing::debug!("Tearing down {} link sessions ({:?})", owners.len(), reason);
        for tx in owners {
            let _ = tx.send(SessionEvent::Ended { reason }).await;
        }
        for pending in news {
            let _ = pending.reply.send(Err(LinkError::ConnectionClosed));
        }
        for pending in services {
            let _ = pending.reply.send(Err(LinkError::ConnectionClosed));
        }
        for pending in ends {
            let _ = pending.reply.send(Err(LinkError::ConnectionClosed));
        }
    }

    async fn enqueue_control(
        &self,
        session_id: u8,
        service_type: ServiceType,
        frame_info: u8,
    ) -> Result<()> {
        let packet = self.codec.control(session_id, service_type, frame_info);
        let queue = self.queue.lock().await;
        queue
            .submit(PendingWrite {
                session_id,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                bytes: Bytes::from(packet.encode_bytes()),
            })
            .await
    }
}
