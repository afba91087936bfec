use std::ops::Range;

/// Maps a flat parameter buffer into per-layer slices.
/// This is the core "offsets + sizes" mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    ranges: Vec<Range<usize>>,
    total: usize,
}

impl Layout {
    /// Builds the layout for layers of the given parameter counts, packed
    /// back to back in layer order.
    pub fn from_sizes<I: IntoIterator<Item = usize>>(sizes: I) -> Self {
        let mut offset = 0;
        let ranges = sizes
            .into_iter()
            .map(|size| {
                let range = offset..offset + size;
                offset += size;
                range
            })
            .collect();

        Self {
            ranges,
            total: offset,
        }
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn ranges(&self) -> impl DoubleEndedIterator<Item = Range<usize>> + ExactSizeIterator + '_ {
        self.ranges.iter().cloned()
    }

    #[inline]
    pub fn range(&self, layer: usize) -> Range<usize> {
        self.ranges[layer].clone()
    }

    /// Sanity check: ranges must be contiguous, in order and cover the buffer.
    pub fn validate(&self, total_params: usize) {
        assert_eq!(self.total, total_params, "layout does not cover the buffer");

        let mut offset = 0;
        for range in &self.ranges {
            assert_eq!(range.start, offset, "layout ranges must be contiguous");
            assert!(range.start <= range.end, "layout range is reversed");
            offset = range.end;
        }

        assert_eq!(offset, total_params, "layout ranges must cover the buffer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_back_to_back() {
        let layout = Layout::from_sizes([6, 3, 2]);
        assert_eq!(layout.total(), 11);
        assert_eq!(layout.range(0), 0..6);
        assert_eq!(layout.range(1), 6..9);
        assert_eq!(layout.range(2), 9..11);
        layout.validate(11);
    }

    #[test]
    fn empty_layout_is_valid() {
        let layout = Layout::from_sizes([]);
        assert_eq!(layout.total(), 0);
        layout.validate(0);
    }
}
