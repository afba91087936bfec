use ndarray::{Array2, ArrayView2, Axis};

/// A differentiable objective over a batch of predictions.
pub trait LossFn: Send {
    /// The mean loss over the batch.
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32;

    /// The gradient of `loss` w.r.t. `y_pred`.
    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32>;
}

/// Mean squared error loss function.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse;

impl Mse {
    /// Returns a new `Mse`.
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for Mse {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        (&y_pred - &y)
            .mapv(|x| x.powi(2))
            .mean()
            .unwrap_or_default()
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        (&y_pred - &y) * (2.0 / y_pred.len() as f32)
    }
}

/// Softmax cross entropy over one-hot labels, averaged over the batch.
///
/// Predictions come in as raw scores; the softmax is folded into the loss
/// so `loss_prime` stays the numerically friendly `softmax(pred) - y`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    /// Returns a new `SoftmaxCrossEntropy`.
    pub fn new() -> Self {
        Self
    }

    fn softmax(y_pred: ArrayView2<f32>) -> Array2<f32> {
        let mut p = y_pred.to_owned();

        for mut row in p.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
        }

        p
    }
}

impl LossFn for SoftmaxCrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let p = Self::softmax(y_pred);
        let n = y_pred.nrows() as f32;

        let mut total = 0.0;
        for (p_row, y_row) in p.axis_iter(Axis(0)).zip(y.axis_iter(Axis(0))) {
            for (&p, &y) in p_row.iter().zip(y_row) {
                if y > 0.0 {
                    total -= y * p.max(1e-12).ln();
                }
            }
        }

        total / n
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let n = y_pred.nrows() as f32;
        (Self::softmax(y_pred) - &y) / n
    }
}
