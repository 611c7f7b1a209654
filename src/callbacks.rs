//! User-facing callback types.
//!
//! All callbacks are shared `Fn` closures: they are installed once on the
//! server (or connection) and invoked from the connection's owning loop
//! thread. The connection handle they receive may be cloned and used from
//! any thread; sends route back through the owning loop.

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use std::sync::Arc;
use std::time::Instant;

/// Shared handle to a connection.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked on transition to Connected and on transition to Disconnected.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked when new readable data has arrived. The handler consumes bytes
/// from the buffer; anything left stays for the next invocation.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;

/// Invoked when the output buffer transitions from non-empty to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked on the upward crossing of the output-buffer threshold; the
/// second argument is the output-buffer size at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Used by the server layer to deregister a closed connection.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Connection callback installed when the user sets none: logs the
/// transition and nothing else.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    tracing::info!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Message callback installed when the user sets none: discards input so
/// an unconfigured server does not accumulate bytes forever.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _when: Instant) {
    let n = buf.len();
    buf.retrieve(n);
}
