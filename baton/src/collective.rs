//! Group communication for tensor-parallel ranks.
//!
//! The only collective the training core needs is an all-reduce mean over
//! flat `f32` buffers, used to keep gradient updates identical across the
//! replicas of one pipeline stage.

use std::io;
use std::num::NonZeroUsize;

use tokio::sync::mpsc;

/// A communication group peer.
///
/// Every member of a group must call `all_reduce_mean` the same number of
/// times with equally sized buffers; calls pair up across the group.
#[trait_variant::make(Collective: Send)]
pub trait LocalCollective {
    /// Replaces `buf` with the element-wise mean over all group members.
    async fn all_reduce_mean(&mut self, buf: &mut [f32]) -> io::Result<()>;
}

/// The collective for a group of one: leaves the buffer untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloCollective;

impl Collective for SoloCollective {
    async fn all_reduce_mean(&mut self, _buf: &mut [f32]) -> io::Result<()> {
        Ok(())
    }
}

/// One member of a fully connected in-process group.
///
/// Each pair of members is wired with its own channel, so per-peer FIFO
/// ordering keeps successive reduce rounds from mixing. The sum is folded
/// in rank order on every member, which makes the result bit-identical
/// across the whole group.
pub struct MeshCollective {
    rank: usize,
    txs: Vec<Option<mpsc::UnboundedSender<Vec<f32>>>>,
    rxs: Vec<Option<mpsc::UnboundedReceiver<Vec<f32>>>>,
}

impl MeshCollective {
    /// Creates a fully connected group of `size` members.
    ///
    /// # Returns
    /// One member per rank, in rank order.
    pub fn group(size: NonZeroUsize) -> Vec<Self> {
        let n = size.get();

        let mut txs: Vec<Vec<Option<mpsc::UnboundedSender<Vec<f32>>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut rxs: Vec<Vec<Option<mpsc::UnboundedReceiver<Vec<f32>>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }

                let (tx, rx) = mpsc::unbounded_channel();
                txs[i][j] = Some(tx);
                rxs[j][i] = Some(rx);
            }
        }

        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (txs, rxs))| Self { rank, txs, rxs })
            .collect()
    }

    /// This member's rank within the group.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of members in the group.
    #[inline]
    pub fn size(&self) -> usize {
        self.txs.len()
    }
}

impl Collective for MeshCollective {
    async fn all_reduce_mean(&mut self, buf: &mut [f32]) -> io::Result<()> {
        for tx in self.txs.iter().flatten() {
            tx.send(buf.to_vec()).map_err(|_| peer_gone())?;
        }

        let mut sum = vec![0.0f32; buf.len()];

        for rx in &mut self.rxs {
            match rx {
                None => add(&mut sum, buf),
                Some(rx) => {
                    let part = rx.recv().await.ok_or_else(peer_gone)?;

                    if part.len() != buf.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "peer reduced {} values, this member holds {}",
                                part.len(),
                                buf.len()
                            ),
                        ));
                    }

                    add(&mut sum, &part);
                }
            }
        }

        let inv = 1.0 / self.txs.len() as f32;
        for (dst, s) in buf.iter_mut().zip(&sum) {
            *dst = s * inv;
        }

        Ok(())
    }
}

fn add(acc: &mut [f32], part: &[f32]) {
    for (a, p) in acc.iter_mut().zip(part) {
        *a += p;
    }
}

fn peer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "collective peer is gone")
}

#[cfg(test)]
mod tests {
    use super::{Collective, MeshCollective, NonZeroUsize, SoloCollective, io};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mesh_reduces_to_the_mean_on_every_member() {
        let group = MeshCollective::group(NonZeroUsize::new(3).unwrap());

        let mut tasks = Vec::new();
        for (rank, mut member) in group.into_iter().enumerate() {
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![rank as f32, 10.0 * rank as f32];
                member.all_reduce_mean(&mut buf).await.unwrap();
                buf
            }));
        }

        for task in tasks {
            let buf = task.await.unwrap();
            assert_eq!(buf, vec![1.0, 10.0]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mesh_rounds_do_not_mix() {
        let mut group = MeshCollective::group(NonZeroUsize::new(2).unwrap());
        let mut b = group.pop().unwrap();
        let mut a = group.pop().unwrap();

        // Both members run two rounds concurrently; per-peer FIFO keeps the
        // pairs aligned even when one member's sends queue up early.
        let fast = tokio::spawn(async move {
            let mut first = vec![1.0];
            a.all_reduce_mean(&mut first).await.unwrap();
            let mut second = vec![3.0];
            a.all_reduce_mean(&mut second).await.unwrap();
            (first, second)
        });

        let mut first = vec![5.0];
        b.all_reduce_mean(&mut first).await.unwrap();
        let mut second = vec![7.0];
        b.all_reduce_mean(&mut second).await.unwrap();

        let (a_first, a_second) = fast.await.unwrap();
        assert_eq!(first, a_first);
        assert_eq!(second, a_second);
        assert_eq!(first, vec![3.0]);
        assert_eq!(second, vec![5.0]);
    }

    #[tokio::test]
    async fn solo_is_identity() {
        let mut solo = SoloCollective;
        let mut buf = vec![1.0, 2.0];
        solo.all_reduce_mean(&mut buf).await.unwrap();
        assert_eq!(buf, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn dropped_peer_is_an_error() {
        let mut group = MeshCollective::group(NonZeroUsize::new(2).unwrap());
        let _ = group.pop();
        let mut member = group.pop().unwrap();

        let mut buf = vec![1.0];
        let err = member.all_reduce_mean(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
