//! The process's place in the parallel topology.

use std::num::NonZeroUsize;

/// Where one rank sits in the `num_stages x tp_size` grid.
///
/// Ranks are laid out stage-major: `rank = stage * tp_size + tp_rank`.
/// Every component receives its context explicitly instead of consulting a
/// process global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParallelContext {
    rank: usize,
    stage: usize,
    num_stages: NonZeroUsize,
    tp_rank: usize,
    tp_size: NonZeroUsize,
}

impl ParallelContext {
    /// Creates the context for one grid position.
    ///
    /// # Panics
    /// Panics when `stage` or `tp_rank` fall outside the grid.
    pub fn new(
        stage: usize,
        num_stages: NonZeroUsize,
        tp_rank: usize,
        tp_size: NonZeroUsize,
    ) -> Self {
        assert!(stage < num_stages.get(), "stage out of range");
        assert!(tp_rank < tp_size.get(), "tp_rank out of range");

        Self {
            rank: stage * tp_size.get() + tp_rank,
            stage,
            num_stages,
            tp_rank,
            tp_size,
        }
    }

    /// The context of a process running alone.
    pub fn solo() -> Self {
        Self::new(0, NonZeroUsize::MIN, 0, NonZeroUsize::MIN)
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.num_stages.get() * self.tp_size.get()
    }

    #[inline]
    pub fn stage(&self) -> usize {
        self.stage
    }

    #[inline]
    pub fn num_stages(&self) -> usize {
        self.num_stages.get()
    }

    #[inline]
    pub fn tp_rank(&self) -> usize {
        self.tp_rank
    }

    #[inline]
    pub fn tp_size(&self) -> usize {
        self.tp_size.get()
    }

    #[inline]
    pub fn is_first_stage(&self) -> bool {
        self.stage == 0
    }

    #[inline]
    pub fn is_last_stage(&self) -> bool {
        self.stage + 1 == self.num_stages.get()
    }

    /// Whether an upstream stage feeds this one.
    #[inline]
    pub fn has_prev(&self) -> bool {
        !self.is_first_stage()
    }

    /// Whether a downstream stage consumes this one's output.
    #[inline]
    pub fn has_next(&self) -> bool {
        !self.is_last_stage()
    }
}
