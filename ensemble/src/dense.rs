use ndarray::{linalg, prelude::*};

use crate::activation::ActFn;

/// A fully connected layer over a flat parameter slice.
///
/// The layer itself is stateless: `forward` hands back everything the
/// matching `backward` call needs, so several micro-batches can be in
/// flight through the same layer at once.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    size: usize,
}

/// What one forward pass saves for its backward pass.
#[derive(Debug)]
pub struct DenseCtx {
    x: Array2<f32>,
    // Pre-activation values, only kept when an activation needs them.
    z: Option<Array2<f32>>,
}

impl Dense {
    /// Creates a dense layer mapping `dim.0` inputs to `dim.1` outputs.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self {
            dim,
            act_fn,
            size: (dim.0 + 1) * dim.1,
        }
    }

    /// The amount of parameters this layer has.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.dim.0
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.dim.1
    }

    /// Computes the layer output for `x`.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of the flat parameter buffer.
    /// * `x` - The input batch, one sample per row.
    ///
    /// # Returns
    /// The output batch and the context the backward pass consumes.
    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> (Array2<f32>, DenseCtx) {
        let (w, b) = self.view_params(params);

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        let x = x.to_owned();

        match &self.act_fn {
            None => {
                let ctx = DenseCtx { x, z: None };
                (z, ctx)
            }
            Some(act_fn) => {
                let a = z.mapv(|v| act_fn.f(v));
                let ctx = DenseCtx { x, z: Some(z) };
                (a, ctx)
            }
        }
    }

    /// Accumulates this layer's parameter gradients and returns the input
    /// gradient.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of the flat parameter buffer.
    /// * `grad` - This layer's slice of the flat gradient buffer, added to.
    /// * `ctx` - The context saved by the matching `forward` call.
    /// * `d` - The gradient flowing in from the next layer.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        ctx: DenseCtx,
        mut d: Array2<f32>,
    ) -> Array2<f32> {
        if let (Some(act_fn), Some(z)) = (&self.act_fn, &ctx.z) {
            d.zip_mut_with(z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(grad);
        linalg::general_mat_mul(1.0, &ctx.x.t(), &d, 1.0, &mut dw);
        db += &d.sum_axis(Axis(0));

        let (w, _) = self.view_params(params);
        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut dx);

        dx
    }

    /// Gives a view of the raw parameter slice as this layer's weights and
    /// biases.
    fn view_params<'a>(&self, params: &'a [f32]) -> (ArrayView2<'a, f32>, ArrayView1<'a, f32>) {
        let w_size = self.size - self.dim.1;
        // SAFETY: Both slices were carved to exactly dim.0 * dim.1 and dim.1.
        let weights = ArrayView2::from_shape(self.dim, &params[..w_size]).unwrap();
        let biases = ArrayView1::from_shape(self.dim.1, &params[w_size..]).unwrap();
        (weights, biases)
    }

    /// Gives a view of the raw gradient slice as this layer's delta weights
    /// and delta biases.
    fn view_grad<'a>(&self, grad: &'a mut [f32]) -> (ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>) {
        let w_size = self.size - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        // SAFETY: Same carving as `view_params`.
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).unwrap();
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw).unwrap();
        (dw, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_is_x_w_plus_b() {
        // 2 inputs -> 1 output, w = [[1], [2]], b = [0.5]
        let layer = Dense::new((2, 1), None);
        let params = [1.0, 2.0, 0.5];
        let x = ndarray::array![[1.0, 1.0], [2.0, 0.0]];

        let (out, _) = layer.forward(&params, x.view());
        assert_eq!(out, ndarray::array![[3.5], [2.5]]);
    }

    #[test]
    fn backward_accumulates_instead_of_overwriting() {
        let layer = Dense::new((2, 1), None);
        let params = [1.0, 2.0, 0.5];
        let x = ndarray::array![[1.0, 2.0]];
        let mut grad = [0.0f32; 3];

        let (_, ctx) = layer.forward(&params, x.view());
        layer.backward(&params, &mut grad, ctx, ndarray::array![[1.0]]);
        let first = grad;

        let (_, ctx) = layer.forward(&params, x.view());
        layer.backward(&params, &mut grad, ctx, ndarray::array![[1.0]]);

        for (twice, once) in grad.iter().zip(first) {
            assert!((twice - 2.0 * once).abs() < 1e-6);
        }
    }

    #[test]
    fn backward_gradients_match_finite_differences() {
        let layer = Dense::new((2, 2), Some(ActFn::Sigmoid));
        let mut params = [0.3, -0.2, 0.1, 0.4, 0.05, -0.1];
        let x = ndarray::array![[0.7, -1.2], [0.4, 0.9]];

        // Scalar objective: sum of outputs.
        let objective = |layer: &Dense, params: &[f32]| -> f32 {
            let (out, _) = layer.forward(params, x.view());
            out.sum()
        };

        let mut grad = [0.0f32; 6];
        let (out, ctx) = layer.forward(&params, x.view());
        let d = Array2::ones(out.raw_dim());
        layer.backward(&params, &mut grad, ctx, d);

        let h = 1e-3;
        for i in 0..params.len() {
            let orig = params[i];
            params[i] = orig + h;
            let up = objective(&layer, &params);
            params[i] = orig - h;
            let down = objective(&layer, &params);
            params[i] = orig;

            let approx = (up - down) / (2.0 * h);
            assert!(
                (grad[i] - approx).abs() < 1e-3,
                "param {i}: {} vs {approx}",
                grad[i]
            );
        }
    }
}
