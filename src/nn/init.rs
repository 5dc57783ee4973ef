use ndarray::IxDyn;
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::{Normal, Uniform};
use serde::{Deserialize, Serialize};

use super::{Layer, Tensor};

/// Used to generate the initial values for the parameters of the model.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Initializer {
    /// Given constant value.
    Constant(f32),
    /// Normal distribution scaled using Glorot scale factor.
    GlorotNormal,
    /// Uniform distribution scaled using Glorot scale factor.
    GlorotUniform,
    /// Normal distribution scaled using He scale factor.
    HeNormal,
    /// Uniform distribution scaled using He scale factor.
    HeUniform,
    /// Normal distribution scaled using Lecun scale factor.
    LecunNormal,
    /// Uniform distribution scaled using Lecun scale factor.
    LecunUniform,
    /// Uniform within `±1/sqrt(fan_in)`, the usual default for dense and conv layers.
    #[default]
    FanInUniform,
    /// Normal distribution with given mean and standard deviation.
    NormalScaled(f32, f32),
    /// Uniform distribution within the given bounds.
    UniformBounded(f32, f32),
    /// Zeros.
    Zeros,
}

impl Initializer {
    /// Creates a tensor with random values generated from the distribution specified by the
    /// initializer.
    ///
    /// # Arguments
    ///
    /// * `dims` - The dimensions of the tensor created.
    /// * `fan_in` - The number of input units.
    /// * `fan_out` - The number of output units.
    pub fn init<R: Rng + ?Sized>(
        self,
        dims: &[usize],
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Tensor {
        let fan_in = fan_in.max(1) as f32;
        let fan_out = fan_out.max(1) as f32;
        match self {
            Initializer::Constant(x) => Tensor::from_elem(IxDyn(dims), x),
            Initializer::GlorotNormal => {
                scaled_normal(0.0, (2. / (fan_out + fan_in)).sqrt(), dims, rng)
            }
            Initializer::GlorotUniform => {
                let limit = (6. / (fan_out + fan_in)).sqrt();
                scaled_uniform(-limit, limit, dims, rng)
            }
            Initializer::HeNormal => scaled_normal(0.0, (2. / fan_in).sqrt(), dims, rng),
            Initializer::HeUniform => {
                let limit = (6. / fan_in).sqrt();
                scaled_uniform(-limit, limit, dims, rng)
            }
            Initializer::LecunNormal => scaled_normal(0.0, (1. / fan_in).sqrt(), dims, rng),
            Initializer::LecunUniform => {
                let limit = (3. / fan_in).sqrt();
                scaled_uniform(-limit, limit, dims, rng)
            }
            Initializer::FanInUniform => {
                let limit = 1. / fan_in.sqrt();
                scaled_uniform(-limit, limit, dims, rng)
            }
            Initializer::NormalScaled(mean, std) => scaled_normal(mean, std, dims, rng),
            Initializer::UniformBounded(lb, ub) => scaled_uniform(lb, ub, dims, rng),
            Initializer::Zeros => Tensor::zeros(IxDyn(dims)),
        }
    }
}

/// Fan in and fan out of a weight tensor `[out, in, k..]`. Transposed
/// convolutions store `[in, out, k..]` and get their fans swapped, the same
/// way torch computes them.
pub fn fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [out, inp, kernel @ ..] => {
            let receptive_field: usize = kernel.iter().product();
            (inp * receptive_field, out * receptive_field)
        }
    }
}

/// Re-draws every weight matrix or filter of `layer` (children included) with
/// `init`. Biases keep their values.
pub fn reinit_weights<R: Rng + ?Sized>(layer: &mut dyn Layer, init: Initializer, rng: &mut R) {
    for p in layer.params_mut() {
        if p.w.ndim() < 2 {
            continue;
        }
        let shape = p.w.shape().to_vec();
        let (fan_in, fan_out) = fans(&shape);
        p.w = init.init(&shape, fan_in, fan_out, rng);
    }
}

fn scaled_normal<R: Rng + ?Sized>(mean: f32, std: f32, dims: &[usize], rng: &mut R) -> Tensor {
    match Normal::new(mean, std.abs()) {
        Ok(dist) => Tensor::random_using(IxDyn(dims), dist, rng),
        Err(_) => Tensor::from_elem(IxDyn(dims), mean),
    }
}

fn scaled_uniform<R: Rng + ?Sized>(lb: f32, ub: f32, dims: &[usize], rng: &mut R) -> Tensor {
    if lb >= ub {
        return Tensor::from_elem(IxDyn(dims), lb);
    }
    Tensor::random_using(IxDyn(dims), Uniform::new(lb, ub), rng)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_init_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = Initializer::FanInUniform.init(&[16, 25], 25, 16, &mut rng);
        assert_eq!(w.shape(), &[16, 25]);
        assert!(w.iter().all(|x| x.abs() <= 0.2));

        let z = Initializer::Zeros.init(&[3], 1, 1, &mut rng);
        assert!(z.iter().all(|x| *x == 0.0));
        let c = Initializer::Constant(0.5).init(&[2, 2], 1, 1, &mut rng);
        assert!(c.iter().all(|x| *x == 0.5));
    }

    #[test]
    fn test_fans() {
        assert_eq!(fans(&[16, 25]), (25, 16));
        assert_eq!(fans(&[8, 3, 5, 5]), (75, 200));
        assert_eq!(fans(&[7]), (7, 7));
    }

    #[test]
    fn test_reinit_keeps_bias() {
        use crate::nn::Linear;
        let mut rng = StdRng::seed_from_u64(4);
        let mut layer = Linear::new(3, 2, true, &mut rng);
        let bias = layer.params()[1].w.clone();
        reinit_weights(&mut layer, Initializer::Constant(0.25), &mut rng);
        assert!(layer.params()[0].w.iter().all(|w| *w == 0.25));
        assert_eq!(layer.params()[0].w.shape(), &[2, 3]);
        assert_eq!(layer.params()[1].w, bias);
    }

    #[test]
    fn test_init_seeded() {
        let a = Initializer::HeNormal.init(&[4, 4], 4, 4, &mut StdRng::seed_from_u64(3));
        let b = Initializer::HeNormal.init(&[4, 4], 4, 4, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
