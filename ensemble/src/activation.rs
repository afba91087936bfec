/// Element-wise activation functions with their derivatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActFn {
    Relu,
    Sigmoid,
}
use ActFn::*;

impl ActFn {
    pub fn f(&self, x: f32) -> f32 {
        match self {
            Relu => x.max(0.0),
            Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }

    /// The derivative at `x`, where `x` is the pre-activation value.
    pub fn df(&self, x: f32) -> f32 {
        match self {
            Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Sigmoid => {
                let s = self.f(x);
                s * (1.0 - s)
            }
        }
    }
}
