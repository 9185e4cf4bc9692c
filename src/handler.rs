use std::time::Duration;

use crate::client::Client;
use crate::conn::Conn;
use crate::server::Server;
use crate::Error;

// -----------------------------------------------------------------------------
//     - Action -
// -----------------------------------------------------------------------------
/// Instruction returned by event callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Carry on.
    None,
    /// Close this connection only.
    Close,
    /// Terminate the whole engine instance.
    Shutdown,
}

impl Default for Action {
    fn default() -> Self {
        Action::None
    }
}

// -----------------------------------------------------------------------------
//     - EventHandler -
// -----------------------------------------------------------------------------
/// The callback bundle driving an engine instance. Every method defaults to
/// a no-op so implementations only override what they care about.
///
/// All callbacks run synchronously on a reactor thread; a blocking callback
/// stalls every connection on that reactor.
pub trait EventHandler: Send + Sync {
    /// Fires once the engine is ready to accept connections.
    fn on_init_complete(&self, _server: &Server) -> Action {
        Action::None
    }

    /// Fires when a new connection has been opened. Returned bytes are
    /// written to the connection immediately.
    fn on_opened(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Fires when a connection has been closed, with the last observed
    /// error if the close was caused by one.
    fn on_closed(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        Action::None
    }

    /// Fires just before any data is written to a socket.
    fn pre_write(&self) {}

    /// Fires when a connection has inbound data to process (or was woken).
    /// Returned bytes are written back to the connection.
    fn react(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Fires immediately after the engine starts when the ticker is
    /// enabled, then again after each returned delay. Returning `None` or a
    /// zero delay stops the ticker.
    fn tick(&self) -> (Option<Duration>, Action) {
        (None, Action::None)
    }

    /// Client only: fires exactly once when the outbound connection's
    /// reactor is running.
    fn on_connection_established(&self, _client: &Client) -> Action {
        Action::None
    }
}
