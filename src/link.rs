//! Link builder and lifecycle.
//!
//! [`LinkBuilder`] configures the negotiated protocol version, payload
//! budget, and queue capacities; [`LinkBuilder::attach`] binds the pump to a
//! raw stream, wires it to a [`SessionRouter`], and returns the running
//! [`Link`]. One `Link` corresponds to exactly one physical connection; when
//! the connection dies the link is finished, and reconnecting is the
//! supervisor's job, not this crate's.
//!
//! # Example
//!
//! ```ignore
//! use headlink::{Link, ServiceType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = headlink::transport::tcp_connect("10.0.0.5:12345").await?;
//!     let mut link = Link::attach(stream);
//!
//!     let mut session = link.register(ServiceType::Rpc).await?.wait().await?;
//!     session.send(ServiceType::Rpc, b"request".as_ref().into()).await?;
//!     while let Some(event) = session.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::Result;
use crate::protocol::{PacketCodec, ProtocolVersion, ServiceType};
use crate::pump::{PumpConfig, TransportPump};
use crate::router::{
    PendingRegistration, RouterStats, SessionRouter, DEFAULT_SESSION_CHANNEL_CAPACITY,
};
use crate::transport::RawTransport;

/// Configuration for one link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Negotiated protocol version; governs header layout on both directions.
    pub version: ProtocolVersion,
    /// Negotiated per-frame payload budget; `None` uses the version default.
    pub max_payload: Option<usize>,
    /// Reader/writer task tuning.
    pub pump: PumpConfig,
    /// Capacity of each session's inbound event channel.
    pub session_channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V5,
            max_payload: None,
            pump: PumpConfig::default(),
            session_channel_capacity: DEFAULT_SESSION_CHANNEL_CAPACITY,
        }
    }
}

/// Counters gathered across the pump and the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Bytes that failed to progress the packet parser.
    pub framing_errors: u64,
    /// Data packets dropped for lack of an ACTIVE session.
    pub orphan_drops: u64,
    /// Fragment trains discarded for ordering/length violations.
    pub reassembly_failures: u64,
    /// HEARTBEAT probes answered without client visibility.
    pub heartbeats_answered: u64,
}

/// Builder for configuring and attaching a link.
#[derive(Debug, Default)]
pub struct LinkBuilder {
    config: LinkConfig,
}

impl LinkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the negotiated protocol version. Default: version 5.
    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.config.version = version;
        self
    }

    /// Override the negotiated per-frame payload budget.
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.config.max_payload = Some(max_payload);
        self
    }

    /// Set the reader loop buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.pump.read_buffer_size = size;
        self
    }

    /// Set the write FIFO channel capacity.
    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.pump.write_queue_capacity = capacity;
        self
    }

    /// Set the backpressure limit on accepted-but-unwritten packets.
    pub fn max_pending_writes(mut self, limit: usize) -> Self {
        self.config.pump.max_pending_writes = limit;
        self
    }

    /// Set how long `send` waits for backpressure to clear.
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.pump.backpressure_timeout = timeout;
        self
    }

    /// Set the capacity of each session's inbound event channel.
    pub fn session_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.session_channel_capacity = capacity;
        self
    }

    /// Bind the pump to `stream` and start the link.
    pub fn attach<S>(self, stream: S) -> Link
    where
        S: RawTransport + 'static,
    {
        let LinkConfig {
            version,
            max_payload,
            pump: pump_config,
            session_channel_capacity,
        } = self.config;

        let codec = match max_payload {
            Some(budget) => PacketCodec::with_max_payload(version, budget),
            None => PacketCodec::new(version),
        };

        let (pump, queue, events) = TransportPump::spawn(stream, pump_config);
        let router = SessionRouter::new(codec, queue, session_channel_capacity);

        let dispatch = router.clone().spawn_dispatch(events);
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = dispatch.await;
            let _ = closed_tx.send(true);
        });

        Link {
            router,
            pump,
            closed: closed_rx,
        }
    }
}

/// A running link over one physical connection.
pub struct Link {
    router: Arc<SessionRouter>,
    pump: TransportPump,
    closed: watch::Receiver<bool>,
}

impl Link {
    /// Attach with default configuration. Use [`Link::builder`] to tune.
    pub fn attach<S>(stream: S) -> Link
    where
        S: RawTransport + 'static,
    {
        Self::builder().attach(stream)
    }

    pub fn builder() -> LinkBuilder {
        LinkBuilder::new()
    }

    /// Request a new session for `service_type`. See [`SessionRouter::register`].
    pub async fn register(&self, service_type: ServiceType) -> Result<PendingRegistration> {
        self.router.register(service_type).await
    }

    /// Submit a message on an ACTIVE session. See [`SessionRouter::send`].
    pub async fn send(
        &self,
        session_id: u8,
        service_type: ServiceType,
        payload: Bytes,
    ) -> Result<()> {
        self.router.send(session_id, service_type, payload).await
    }

    /// Start an additional service on a bound session.
    pub async fn add_service(&self, session_id: u8, service_type: ServiceType) -> Result<()> {
        self.router.add_service(session_id, service_type).await
    }

    /// End one service on a session; resolves on the peer's confirmation.
    pub async fn end_session(&self, session_id: u8, service_type: ServiceType) -> Result<()> {
        self.router.end_session(session_id, service_type).await
    }

    /// Diagnostic counters for this link.
    pub fn stats(&self) -> LinkStats {
        let RouterStats {
            orphan_drops,
            reassembly_failures,
            heartbeats_answered,
        } = self.router.stats();
        LinkStats {
            framing_errors: self.pump.framing_errors(),
            orphan_drops,
            reassembly_failures,
            heartbeats_answered,
        }
    }

    /// Wait until the link is finished (connection lost or stopped).
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the link: signal both pump loops, close the stream once, and end
    /// every session with [`EndReason::Closed`](crate::router::EndReason::Closed).
    /// Idempotent; never raises a spurious connection-lost event.
    pub async fn stop(&mut self) {
        self.pump.stop().await;
        self.closed().await;
    }
}
