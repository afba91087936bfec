use std::collections::BTreeMap;

/// One metric accumulator.
#[derive(Debug, Clone, Copy)]
pub enum Scalar {
    /// Running mean of recorded values.
    Mean { sum: f64, count: u64 },
    /// Hit ratio, e.g. correct predictions over samples seen.
    Ratio { hit: u64, total: u64 },
    /// A plain last-write-wins value.
    Value(f64),
}

impl Scalar {
    /// The resolved value, `None` while nothing was recorded.
    pub fn value(&self) -> Option<f64> {
        match *self {
            Scalar::Mean { count: 0, .. } | Scalar::Ratio { total: 0, .. } => None,
            Scalar::Mean { sum, count } => Some(sum / count as f64),
            Scalar::Ratio { hit, total } => Some(hit as f64 / total as f64),
            Scalar::Value(v) => Some(v),
        }
    }

    fn cleared(&self) -> Scalar {
        match self {
            Scalar::Mean { .. } => Scalar::Mean { sum: 0.0, count: 0 },
            Scalar::Ratio { .. } => Scalar::Ratio { hit: 0, total: 0 },
            Scalar::Value(_) => Scalar::Value(0.0),
        }
    }
}

/// Named metric registry shared by hooks through the hook context.
///
/// Names follow a `phase/metric` convention (`train/loss`, `test/accuracy`);
/// iteration is deterministic in sorted name order.
#[derive(Debug, Default)]
pub struct Metrics {
    scalars: BTreeMap<String, Scalar>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one value into the named running mean.
    pub fn add_mean(&mut self, name: &str, value: f64) {
        match self.entry(name, Scalar::Mean { sum: 0.0, count: 0 }) {
            Scalar::Mean { sum, count } => {
                *sum += value;
                *count += 1;
            }
            other => *other = Scalar::Mean { sum: value, count: 1 },
        }
    }

    /// Folds hits into the named ratio.
    pub fn add_ratio(&mut self, name: &str, hit: u64, total: u64) {
        match self.entry(name, Scalar::Ratio { hit: 0, total: 0 }) {
            Scalar::Ratio { hit: h, total: t } => {
                *h += hit;
                *t += total;
            }
            other => *other = Scalar::Ratio { hit, total },
        }
    }

    /// Overwrites the named value.
    pub fn set_value(&mut self, name: &str, value: f64) {
        *self.entry(name, Scalar::Value(0.0)) = Scalar::Value(value);
    }

    /// The resolved value of a metric, `None` when unknown or empty.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).and_then(Scalar::value)
    }

    /// Clears one accumulator back to empty, keeping its kind.
    pub fn reset(&mut self, name: &str) {
        if let Some(scalar) = self.scalars.get_mut(name) {
            *scalar = scalar.cleared();
        }
    }

    /// All resolved metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.scalars
            .iter()
            .filter_map(|(name, scalar)| scalar.value().map(|v| (name.as_str(), v)))
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty()
    }

    fn entry(&mut self, name: &str, default: Scalar) -> &mut Scalar {
        self.scalars.entry(name.to_string()).or_insert(default)
    }
}
