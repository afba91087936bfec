use ndarray::prelude::*;

use crate::dense::{Dense, DenseCtx};
use crate::error::{ModelError, Result};
use crate::layout::Layout;

/// The per-forward state a backward pass consumes, one entry per layer.
///
/// Tapes are plain values: a caller may hold several of them while their
/// micro-batches are still in flight and replay them in any order.
#[derive(Debug)]
pub struct Tape {
    ctxs: Vec<DenseCtx>,
}

/// A sequential model over one flat parameter buffer: information flows
/// forward when computing an output and backward when accumulating
/// gradients.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<Dense>,
    layout: Layout,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the model is composed of, in forward order.
    ///
    /// # Errors
    /// Rejects an empty layer list and neighbouring layers whose
    /// dimensions do not line up.
    pub fn new<I>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = Dense>,
    {
        let layers: Vec<Dense> = layers.into_iter().collect();

        if layers.is_empty() {
            return Err(ModelError::EmptyModel);
        }

        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].out_dim() != pair[1].in_dim() {
                return Err(ModelError::DimMismatch {
                    layer: i + 1,
                    got: pair[0].out_dim(),
                    expected: pair[1].in_dim(),
                });
            }
        }

        let layout = Layout::from_sizes(layers.iter().map(Dense::size));

        Ok(Self { layers, layout })
    }

    /// The total amount of parameters of the model.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.total()
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.layers[0].in_dim()
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].out_dim()
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `params` - The flat parameter buffer.
    /// * `x` - The input data, one sample per row.
    ///
    /// # Returns
    /// The prediction for the given input and the tape for its backward
    /// pass.
    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> Result<(Array2<f32>, Tape)> {
        self.check_len("params", params.len())?;

        if x.ncols() != self.in_dim() {
            return Err(ModelError::SizeMismatch {
                what: "input columns",
                got: x.ncols(),
                expected: self.in_dim(),
            });
        }

        let mut ctxs = Vec::with_capacity(self.layers.len());
        let mut out = x.to_owned();

        for (layer, range) in self.layers.iter().zip(self.layout.ranges()) {
            let (next, ctx) = layer.forward(&params[range], out.view());
            ctxs.push(ctx);
            out = next;
        }

        Ok((out, Tape { ctxs }))
    }

    /// Walks the tape backwards, accumulating parameter gradients.
    ///
    /// # Arguments
    /// * `params` - The flat parameter buffer.
    /// * `grad` - The flat gradient buffer, added to.
    /// * `tape` - The tape saved by the matching `forward` call.
    /// * `d` - The gradient of the objective w.r.t. the model output.
    ///
    /// # Returns
    /// The gradient w.r.t. the model input.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        tape: Tape,
        d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        self.check_len("params", params.len())?;
        self.check_len("grad", grad.len())?;

        if tape.ctxs.len() != self.layers.len() {
            return Err(ModelError::SizeMismatch {
                what: "tape entries",
                got: tape.ctxs.len(),
                expected: self.layers.len(),
            });
        }

        let mut d = d;
        let walk = self.layers.iter().zip(self.layout.ranges()).zip(tape.ctxs);

        for ((layer, range), ctx) in walk.rev() {
            d = layer.backward(&params[range.clone()], &mut grad[range], ctx, d);
        }

        Ok(d)
    }

    /// Splits the model into `parts` consecutive non-empty sub-models,
    /// balanced by layer count, for pipeline staging.
    pub fn split_into(&self, parts: usize) -> Result<Vec<Sequential>> {
        if parts == 0 || self.layers.len() < parts {
            return Err(ModelError::TooFewLayers {
                layers: self.layers.len(),
                parts,
            });
        }

        let total = self.layers.len();
        let base = total / parts;
        let rem = total % parts;

        let mut split = Vec::with_capacity(parts);
        let mut start = 0;

        for part in 0..parts {
            let len = base + usize::from(part < rem);
            let layers = self.layers[start..start + len].to_vec();
            start += len;

            // SAFETY: Non-empty consecutive slices of a valid model stay valid.
            split.push(Sequential::new(layers).unwrap());
        }

        Ok(split)
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.size() {
            return Err(ModelError::SizeMismatch {
                what,
                got,
                expected: self.size(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActFn;

    fn model() -> Sequential {
        Sequential::new([
            Dense::new((3, 4), Some(ActFn::Relu)),
            Dense::new((4, 2), None),
        ])
        .unwrap()
    }

    #[test]
    fn size_covers_all_layers() {
        // (3+1)*4 + (4+1)*2
        assert_eq!(model().size(), 26);
    }

    #[test]
    fn mismatched_layer_dims_are_rejected() {
        let err = Sequential::new([Dense::new((3, 4), None), Dense::new((5, 2), None)]).unwrap_err();
        assert!(matches!(err, ModelError::DimMismatch { layer: 1, .. }));
    }

    #[test]
    fn split_halves_compose_to_the_whole() {
        let model = model();
        let params: Vec<f32> = (0..model.size()).map(|i| (i as f32) * 0.01 - 0.1).collect();
        let x = ndarray::array![[0.5, -1.0, 2.0], [1.5, 0.0, -0.5]];

        let (whole, _) = model.forward(&params, x.view()).unwrap();

        let split = model.split_into(2).unwrap();
        let (head, tail) = (&split[0], &split[1]);
        let (head_params, tail_params) = params.split_at(head.size());

        let (mid, _) = head.forward(head_params, x.view()).unwrap();
        let (out, _) = tail.forward(tail_params, mid.view()).unwrap();

        assert_eq!(out, whole);
    }

    #[test]
    fn split_needs_enough_layers() {
        let err = model().split_into(3).unwrap_err();
        assert!(matches!(err, ModelError::TooFewLayers { layers: 2, parts: 3 }));
    }

    #[test]
    fn stale_tape_is_rejected() {
        let model = model();
        let params = vec![0.0; model.size()];
        let mut grad = vec![0.0; model.size()];

        let other = Sequential::new([Dense::new((3, 2), None)]).unwrap();
        let (_, tape) = other
            .forward(&vec![0.0; other.size()], ndarray::array![[1.0, 2.0, 3.0]].view())
            .unwrap();

        let err = model
            .backward(&params, &mut grad, tape, ndarray::array![[1.0, 1.0]])
            .unwrap_err();
        assert!(matches!(err, ModelError::SizeMismatch { what: "tape entries", .. }));
    }
}
