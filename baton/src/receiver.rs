//! The receiving end of the stage link protocol.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::frame::Frame;
use crate::{LEN_TYPE_SIZE, LenType};

/// Upper bound accepted for a single frame body.
const MAX_FRAME_LEN: usize = 1 << 30;

/// The receiving half of a stage link.
pub struct LinkReceiver<R: AsyncRead + Unpin> {
    rx: R,
    // u32 storage keeps tensor payloads 4-byte aligned for the in-place cast.
    scratch: Vec<u32>,
}

impl<R: AsyncRead + Unpin> LinkReceiver<R> {
    /// Creates a new `LinkReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(crate) fn new(rx: R) -> Self {
        Self {
            rx,
            scratch: Vec::new(),
        }
    }

    /// Waits for the next frame from the inner reader.
    ///
    /// # Returns
    /// A result object that returns the decoded `Frame` on success or
    /// `io::Error` on failure.
    pub async fn recv(&mut self) -> io::Result<Frame> {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
            ));
        }

        let needed = len.div_ceil(size_of::<u32>());
        self.scratch.clear();
        self.scratch.reserve(needed);

        // SAFETY: The buffer has capacity for at least `needed` items. These
        //         will be immediately overwritten in the read_exact call.
        unsafe { self.scratch.set_len(needed) };

        let view: &mut [u8] = bytemuck::cast_slice_mut(&mut self.scratch);
        let body = &mut view[..len];
        self.rx.read_exact(body).await?;

        Frame::decode(body)
    }
}
