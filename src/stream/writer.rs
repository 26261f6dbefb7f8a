//! Write side of a stream connection.

use crate::error::Result;
use crate::transport::Transport;

use super::reader::StreamReader;

/// Write half of a stream connection.
///
/// `write` never suspends; use [`drain`](Self::drain) for backpressure.
/// Dropping the writer closes the connection if it is still open.
pub struct StreamWriter {
    transport: Transport,
    reader: Option<StreamReader>,
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl StreamWriter {
    pub(crate) fn new(transport: Transport, reader: Option<StreamReader>) -> Self {
        Self { transport, reader }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Queue `data` for the peer.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.transport.write(data)
    }

    /// Queue each item in order.
    pub fn write_lines<I>(&self, lines: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        for line in lines {
            self.transport.write(line.as_ref())?;
        }
        Ok(())
    }

    /// Half-close after the buffered data is flushed.
    pub fn write_eof(&self) -> Result<()> {
        self.transport.write_eof()
    }

    /// See [`Transport::can_write_eof`].
    pub fn can_write_eof(&self) -> bool {
        self.transport.can_write_eof()
    }

    /// Flush what is buffered, then close.
    pub fn close(&self) {
        self.transport.close();
    }

    /// `true` once closing has started.
    pub fn is_closing(&self) -> bool {
        self.transport.is_closing()
    }

    /// Suspend until the connection is fully closed.
    pub async fn wait_closed(&self) {
        self.transport.wait_closed().await;
    }

    /// Wait until the write buffer is back at the low-water mark.
    ///
    /// Returns immediately when it already is. Fails with the error the
    /// connection was lost with, or `ConnectionReset` if it closed with
    /// bytes still queued.
    pub async fn drain(&self) -> Result<()> {
        if let Some(err) = self.reader.as_ref().and_then(StreamReader::exception) {
            return Err(err);
        }
        self.transport.wait_drained().await
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.transport.is_closing() {
            self.transport.close();
        }
    }
}
