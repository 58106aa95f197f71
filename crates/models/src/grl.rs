//! Gradient reversal built from autodiff primitives.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Identity in the forward pass; multiplies the incoming gradient by `-lambda` on the way back.
///
/// `-lambda * x + (1 + lambda) * detach(x)` evaluates to `x`, while only the first term
/// carries a gradient.
pub fn reverse_gradient<B: Backend, const D: usize>(input: Tensor<B, D>, lambda: f32) -> Tensor<B, D> {
    let passthrough = input.clone().detach().mul_scalar(1.0 + lambda);
    input.mul_scalar(-lambda) + passthrough
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type ADBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn forward_is_identity() {
        let device = Default::default();
        let x = Tensor::<ADBackend, 1>::from_floats([1.0, -2.0, 3.5], &device);
        let y = reverse_gradient(x, 0.7);
        let values = y.into_data().to_vec::<f32>().unwrap();
        for (got, want) in values.iter().zip([1.0f32, -2.0, 3.5]) {
            assert!((got - want).abs() < 1e-5, "{got} != {want}");
        }
    }

    #[test]
    fn gradient_is_negated_and_scaled() {
        let device = Default::default();
        let x = Tensor::<ADBackend, 1>::from_floats([1.0, 2.0], &device).require_grad();
        let grads = reverse_gradient(x.clone(), 0.5).sum().backward();
        let grad = x.grad(&grads).expect("input gradient");
        let values = grad.into_data().to_vec::<f32>().unwrap();
        for v in values {
            assert!((v + 0.5).abs() < 1e-6, "expected -0.5, got {v}");
        }
    }

    #[test]
    fn zero_lambda_blocks_gradient() {
        let device = Default::default();
        let x = Tensor::<ADBackend, 1>::from_floats([4.0], &device).require_grad();
        let grads = reverse_gradient(x.clone(), 0.0).sum().backward();
        let values = x
            .grad(&grads)
            .map(|g| g.into_data().to_vec::<f32>().unwrap())
            .unwrap_or_default();
        assert!(values.iter().all(|v| v.abs() < 1e-6));
    }
}
