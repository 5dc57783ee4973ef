use anyhow::{Error, Result};
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::StandardNormal;

use super::Tensor;

pub fn randn<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Tensor {
    Tensor::random_using(IxDyn(shape), StandardNormal, rng)
}

/// Views a batch as `[batch, features]`.
pub fn flatten_batch(x: &Tensor) -> Array2<f32> {
    let batch = x.shape().first().copied().unwrap_or(1);
    let features = if batch == 0 { 0 } else { x.len() / batch };
    x.as_standard_layout()
        .into_owned()
        .into_shape((batch, features))
        .expect("a standard layout array can always be flattened")
}

/// Per-example sum of `a * b` over every non-batch axis.
pub fn batch_dot(a: &Tensor, b: &Tensor) -> Array1<f32> {
    let a = flatten_batch(a);
    let b = flatten_batch(b);
    (&a * &b).sum_axis(Axis(1))
}

/// Mean over the batch of the per-example squared euclidean norm.
pub fn mean_sq_norm(x: &Tensor) -> f32 {
    let per_example = batch_dot(x, x);
    per_example.mean().unwrap_or(0.0)
}

pub fn l2_norm(x: &Tensor) -> f32 {
    x.fold(0.0, |acc, v| acc + v * v).sqrt()
}

pub fn isclose(a: &Tensor, b: &Tensor, atol: f32, rtol: f32) -> bool {
    a.shape() == b.shape()
        && a.iter().zip(b.iter()).all(|(i, j)| (i - j).abs() <= atol + rtol * j.abs())
}

/// computes the jacobian with finite-difference approximation
/// where f: R^n -> R^m, the jacobian is R^nxm
pub fn compute_jacobian(
    input: &Tensor,
    f: impl Fn(&Tensor) -> Tensor,
    epsilon: f32,
) -> Array2<f32> {
    // dy/dx = lim h->0 (f(x + h) - f(x - h)) / (2h)
    let d_eps = 2.0 * epsilon;
    let mut input = input.as_standard_layout().into_owned();
    let n = input.len();
    let m = f(&input).len();

    let mut jac = Array2::<f32>::zeros((n, m));
    for i in 0..n {
        let old = input.as_slice_mut().expect("contiguous input")[i];
        input.as_slice_mut().expect("contiguous input")[i] = old + epsilon;
        let diff1 = f(&input);
        input.as_slice_mut().expect("contiguous input")[i] = old - epsilon;
        let diff2 = f(&input);

        jac.index_axis_mut(Axis(0), i)
            .iter_mut()
            .zip(diff1.iter())
            .zip(diff2.iter())
            .for_each(|((x, d1), d2)| {
                *x = (*d1 - *d2) / d_eps;
            });
        input.as_slice_mut().expect("contiguous input")[i] = old;
    }

    jac
}

/// Checks a vector-jacobian product `df` of `f` against finite differences.
/// df maps a gradient w.r.t. the image of f to a gradient w.r.t. its input.
/// grads are considered equal if the analytical gradient x, and pertubed gradient y
/// satisfies |x - y| <= atol + rtol * |y|,
/// epsilon is defaulted to 1e-2, atol to 1e-2 and rtol to 1e-2 (f32 arithmetic)
pub fn grad_check(
    input: &Tensor,
    f: impl Fn(&Tensor) -> Tensor,
    df: impl Fn(&Tensor) -> Tensor,
    epsilon: Option<f32>,
    atol: Option<f32>,
    rtol: Option<f32>,
) -> Result<()> {
    let epsilon = epsilon.unwrap_or(1e-2);
    let atol = atol.unwrap_or(1e-2);
    let rtol = rtol.unwrap_or(1e-2);

    let input = input.as_standard_layout().into_owned();
    let out = f(&input);
    let n = input.len();
    let m = out.len();
    let mut dy = Tensor::zeros(out.raw_dim());
    let test_grad = df(&dy);
    if test_grad.len() != n {
        return Err(Error::msg(format!(
            "f maps R{n} to R{m}, but df maps R{m} to R{}",
            test_grad.len()
        )));
    }
    let jacobian = compute_jacobian(&input, f, epsilon);

    for i in 0..m {
        dy.as_slice_mut().expect("contiguous gradient")[i] = 1.0;
        let grad = df(&dy);
        let column = jacobian.index_axis(Axis(1), i);
        for (x, y) in grad.iter().zip(column.iter()) {
            if (x - y).abs() > atol + rtol * y.abs() {
                return Err(Error::msg(format!(
                    "jacobian mismatch on column {i} \n jacobian computed: \n {column} \
                     \n analytical computed: \n {grad}"
                )));
            }
        }
        dy.as_slice_mut().expect("contiguous gradient")[i] = 0.0;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_grad_check() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = randn(&[7], &mut rng);
        let f = |x: &Tensor| x.mapv(|v| 3.0 * v + v.sin());
        let xs = x.clone();
        let df = move |g: &Tensor| g * &xs.mapv(|v| 3.0 + v.cos());
        grad_check(&x, f, df, None, None, None).unwrap();

        let wrong = |g: &Tensor| g * 2.0;
        assert!(grad_check(&x, f, wrong, None, None, None).is_err());
    }

    #[test]
    fn test_batch_reductions() {
        let x = Tensor::from_shape_vec(IxDyn(&[2, 2, 1]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(batch_dot(&x, &x).to_vec(), vec![5.0, 25.0]);
        assert_eq!(mean_sq_norm(&x), 15.0);
        assert!(isclose(&x, &x, 0.0, 0.0));
    }
}
