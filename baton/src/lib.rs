//! Stage-to-stage transport for pipeline-parallel training.
//!
//! The crate covers three concerns: the framed wire codec for tensors and
//! control commands (`frame`, `LinkSender`, `LinkReceiver`), the `StagePort`
//! abstraction a schedule drives without knowing what carries the bytes
//! (`port`), and group communication plus topology bookkeeping for
//! tensor-parallel replicas (`collective`, `topology`).

pub mod collective;
pub mod frame;
pub mod port;
pub mod topology;

mod receiver;
mod sender;

use tokio::io::{AsyncRead, AsyncWrite};

pub use collective::{Collective, MeshCollective, SoloCollective};
pub use frame::{Command, Frame, Tensor, WireDtype};
pub use port::{ChanPort, LinkPort, MemPort, StagePort, chan_pair, mem_link};
pub use receiver::LinkReceiver;
pub use sender::LinkSender;
pub use topology::ParallelContext;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Creates both `LinkReceiver` and `LinkSender` halves of a stage link.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// The receiving and sending halves of the link.
pub fn channel<R, W>(rx: R, tx: W) -> (LinkReceiver<R>, LinkSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (LinkReceiver::new(rx), LinkSender::new(tx))
}
