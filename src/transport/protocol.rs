//! Callback interface driven by a [`Transport`].

use crate::error::TransportError;

use super::Transport;

/// Receiver of connection events.
///
/// Callbacks run on the dispatcher thread. `connection_made` is called once
/// when the transport opens; `connection_lost` exactly once when it closes.
/// `connection_lost` and the flow-control hooks are called from the
/// transport's own task, so they never nest inside another callback.
pub trait Protocol {
    /// The transport is open. Keep a clone to write back to the peer.
    fn connection_made(&mut self, transport: &Transport);

    /// Bytes arrived from the peer.
    fn data_received(&mut self, data: &[u8]);

    /// The peer half-closed its end.
    ///
    /// Return `true` to keep the transport open for writing; `false`
    /// closes it.
    fn eof_received(&mut self) -> bool;

    /// The connection is closed. `None` for an orderly close.
    fn connection_lost(&mut self, error: Option<TransportError>);

    /// The write buffer went above the high-water mark.
    fn pause_writing(&mut self) {}

    /// The write buffer fell back to the low-water mark.
    fn resume_writing(&mut self) {}
}
