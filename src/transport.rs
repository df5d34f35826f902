//! Transport abstraction.
//!
//! Physical transports (Bluetooth SPP, USB accessory, TCP) are external
//! collaborators: the core sees them only as raw duplex byte streams. Any
//! type implementing tokio's `AsyncRead + AsyncWrite` qualifies; the
//! [`RawTransport`] alias is the bound [`Link::attach`](crate::Link::attach)
//! accepts. A TCP connector is provided since it comes for free with the
//! runtime; Bluetooth and USB streams are supplied by platform glue above
//! this crate.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::Result;

/// A raw duplex byte stream the pump can own.
pub trait RawTransport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawTransport for T {}

/// Open a TCP connection to a head-unit, e.g. an emulator or a Wi-Fi link.
pub async fn tcp_connect<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
