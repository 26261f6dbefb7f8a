//! Adapter from transport callbacks to a [`StreamReader`].

use std::rc::Rc;

use crate::error::TransportError;
use crate::transport::{Protocol, Transport};

use super::reader::StreamReader;
use super::writer::StreamWriter;

/// Called once per accepted connection with its reader and writer.
pub(crate) type ConnectedCallback = Rc<dyn Fn(StreamReader, StreamWriter)>;

/// Feeds received bytes into a [`StreamReader`].
///
/// Server-side instances also build the [`StreamWriter`] in
/// `connection_made` and hand the pair to the connection callback.
pub(crate) struct StreamReaderProtocol {
    reader: StreamReader,
    on_connected: Option<ConnectedCallback>,
}

impl StreamReaderProtocol {
    pub(crate) fn new(reader: StreamReader) -> Self {
        Self {
            reader,
            on_connected: None,
        }
    }

    pub(crate) fn with_callback(reader: StreamReader, on_connected: ConnectedCallback) -> Self {
        Self {
            reader,
            on_connected: Some(on_connected),
        }
    }
}

impl Protocol for StreamReaderProtocol {
    fn connection_made(&mut self, transport: &Transport) {
        self.reader.set_transport(transport);
        if let Some(callback) = self.on_connected.take() {
            let writer = StreamWriter::new(transport.clone(), Some(self.reader.clone()));
            callback(self.reader.clone(), writer);
        }
    }

    fn data_received(&mut self, data: &[u8]) {
        self.reader.feed_data(data);
    }

    /// Keep the transport open so the handler can still reply.
    fn eof_received(&mut self) -> bool {
        self.reader.feed_eof();
        true
    }

    fn connection_lost(&mut self, error: Option<TransportError>) {
        match error {
            Some(err) => self.reader.set_exception(err),
            None => self.reader.feed_eof(),
        }
    }
}
