use std::sync::Arc;

use ax25core::frame::Ax25Frame;

use crate::client::ClientId;
use crate::connection::Connection;

/// Observer for connectionless UI traffic, either controller-wide or scoped
/// to a single connection.
pub trait UiObserver: Send + Sync + 'static {
    fn ui_frame_received(&self, frame: &Ax25Frame, client: ClientId, port: u8);
}

/// Observer for the data service of one connection.
pub trait DataObserver: Send + Sync + 'static {
    /// An in-sequence I-frame payload was accepted.
    fn data_received(&self, data: &[u8]);

    /// The link went down: release completed, the peer sent DM, or retries
    /// were exhausted. No further data will arrive.
    fn disconnected(&self) {}
}

/// Callback invoked by the controller when an inbound frame for a registered
/// listener creates a new connection.
pub trait ConnectionAcceptor: Send + Sync + 'static {
    fn connection_accepted(&self, connection: Arc<Connection>);
}
