//! The sending end of the stage link protocol.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::frame::{Frame, WireDtype};
use crate::{LEN_TYPE_SIZE, LenType};

/// The sending half of a stage link.
pub struct LinkSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
    dtype: WireDtype,
}

impl<W: AsyncWrite + Unpin> LinkSender<W> {
    /// Creates a new `LinkSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(crate) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
            dtype: WireDtype::F32,
        }
    }

    /// Switches the payload encoding used for tensor frames from here on.
    pub fn set_wire_dtype(&mut self, dtype: WireDtype) {
        self.dtype = dtype;
    }

    /// Sends `frame` through the inner writer.
    ///
    /// # Arguments
    /// * `frame` - The frame to put on the wire.
    ///
    /// # Returns
    /// A result object that returns `io::Error` on failure.
    pub async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let Self { tx, buf, dtype } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let zero_copy_data = frame.encode(*dtype, buf);
        let len = buf.len() - LEN_TYPE_SIZE + zero_copy_data.map(<[_]>::len).unwrap_or_default();
        let header = (len as LenType).to_be_bytes();

        buf[..header.len()].copy_from_slice(&header);

        tx.write_all(buf).await?;

        if let Some(data) = zero_copy_data {
            tx.write_all(data).await?;
        }

        tx.flush().await
    }
}
