//! Point-to-point ports between neighbouring pipeline stages.
//!
//! A pipeline schedule never talks to a socket directly; it drives a
//! `StagePort`. `LinkPort` runs the wire codec over any async byte stream
//! (an in-memory duplex in tests, a TCP stream in deployment), `ChanPort`
//! moves decoded frames over a process-local channel.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::frame::{Frame, WireDtype};
use crate::{LinkReceiver, LinkSender, channel};

/// One end of a stage-to-stage connection.
///
/// Frames from one sender arrive in the order they were sent.
#[trait_variant::make(StagePort: Send)]
pub trait LocalStagePort {
    /// Delivers `frame` to the peer stage.
    async fn send(&mut self, frame: Frame) -> io::Result<()>;

    /// Waits for the peer stage's next frame.
    async fn recv(&mut self) -> io::Result<Frame>;
}

/// A port running the wire codec over an async byte stream.
pub struct LinkPort<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: LinkReceiver<R>,
    tx: LinkSender<W>,
}

impl<R, W> LinkPort<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a port over a raw reader/writer pair.
    pub fn new(rx: R, tx: W) -> Self {
        let (rx, tx) = channel(rx, tx);
        Self { rx, tx }
    }

    /// Switches the payload encoding used for outgoing tensor frames.
    pub fn set_wire_dtype(&mut self, dtype: WireDtype) {
        self.tx.set_wire_dtype(dtype);
    }
}

impl<R, W> StagePort for LinkPort<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.tx.send(&frame).await
    }

    async fn recv(&mut self) -> io::Result<Frame> {
        self.rx.recv().await
    }
}

/// A `LinkPort` over one half of an in-memory duplex stream.
pub type MemPort = LinkPort<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Creates two connected in-memory ports running the full wire codec.
///
/// # Arguments
/// * `capacity` - The byte capacity of each duplex direction.
pub fn mem_link(capacity: usize) -> (MemPort, MemPort) {
    let (one, two) = tokio::io::duplex(capacity);

    let (rx1, tx1) = tokio::io::split(one);
    let (rx2, tx2) = tokio::io::split(two);

    (LinkPort::new(rx1, tx1), LinkPort::new(rx2, tx2))
}

/// A port moving decoded frames over process-local channels, no codec.
pub struct ChanPort {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl StagePort for ChanPort {
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer port is gone"))
    }

    async fn recv(&mut self) -> io::Result<Frame> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "peer port is gone"))
    }
}

/// Creates two connected process-local ports.
pub fn chan_pair() -> (ChanPort, ChanPort) {
    let (tx1, rx2) = mpsc::unbounded_channel();
    let (tx2, rx1) = mpsc::unbounded_channel();

    (ChanPort { tx: tx1, rx: rx1 }, ChanPort { tx: tx2, rx: rx2 })
}
