//! Seams towards the raw socket primitive.
//!
//! swoop never opens sockets itself. The caller injects a [`Connector`],
//! which produces at most one [`Transport`] per request. Incoming bytes and
//! socket lifecycle are reported back to the engine through the
//! `socket_data`/`socket_end`/`socket_error`/`socket_closed` methods on
//! [`ClientRequest`][crate::ClientRequest], which keeps this side testable
//! without any real network.

use crate::error::Error;
use crate::options::TlsOptions;

/// Write half of an open connection, owned by the engine.
pub trait Transport {
    /// Write the entire buffer to the underlying socket.
    fn send(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Tear the connection down. Called at most once.
    fn close(&mut self);
}

/// Where to connect. A unix socket path takes precedence over host/port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectAddr {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

/// Parameters for one connection attempt, derived from the request
/// descriptor. `tls` is set exactly when the request protocol is https,
/// with the server name defaulted to the request host.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub addr: ConnectAddr,
    pub tls: Option<TlsOptions>,
}

/// Result of [`Connector::connect`].
pub enum ConnectOutcome {
    /// The connection opened synchronously.
    Connected(Box<dyn Transport>),
    /// The dial is in flight. The driver completes it later through
    /// [`ClientRequest::connect_done`][crate::ClientRequest::connect_done].
    Pending,
    /// The dial failed. Surfaces as an error event, never a panic and
    /// never a retry.
    Failed(Error),
}

/// Opens transport connections. One request dials at most once.
pub trait Connector {
    fn connect(&mut self, params: &ConnectParams) -> ConnectOutcome;
}
