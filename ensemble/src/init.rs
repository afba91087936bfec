use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::sequential::Sequential;

/// Fills a fresh parameter buffer for `model`.
///
/// Weights are drawn uniformly from the Xavier range of their layer,
/// biases start at zero. The same seed always produces the same buffer,
/// which is what keeps tensor-parallel replicas aligned at step zero.
///
/// # Arguments
/// * `model` - The model whose layout decides where each layer lives.
/// * `seed` - `None` draws the seed from the operating system.
pub fn seeded_params(model: &Sequential, seed: Option<u64>) -> Vec<f32> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut params = vec![0.0; model.size()];

    for (layer, range) in model.layers().iter().zip(model.layout().ranges()) {
        let (fan_in, fan_out) = (layer.in_dim(), layer.out_dim());
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();

        let w_size = fan_in * fan_out;
        for w in &mut params[range][..w_size] {
            *w = rng.random_range(-limit..limit);
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActFn;
    use crate::dense::Dense;

    fn model() -> Sequential {
        Sequential::new([
            Dense::new((4, 3), Some(ActFn::Relu)),
            Dense::new((3, 2), None),
        ])
        .unwrap()
    }

    #[test]
    fn same_seed_same_params() {
        let model = model();
        assert_eq!(seeded_params(&model, Some(7)), seeded_params(&model, Some(7)));
    }

    #[test]
    fn different_seeds_differ() {
        let model = model();
        assert_ne!(seeded_params(&model, Some(7)), seeded_params(&model, Some(8)));
    }

    #[test]
    fn biases_start_at_zero() {
        let model = model();
        let params = seeded_params(&model, Some(7));

        // First layer biases sit after its 4x3 weight block.
        assert_eq!(&params[12..15], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn weights_stay_in_the_xavier_range() {
        let model = model();
        let params = seeded_params(&model, Some(42));
        let limit = (6.0f32 / 7.0).sqrt();

        assert!(params[..12].iter().all(|w| w.abs() <= limit));
    }
}
