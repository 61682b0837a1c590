//! Minimal owned NCHW tensor used by the measurement pipeline.
//!
//! Channel planes are contiguous, which is what the convolution and pooling
//! kernels iterate over.

use crate::errors::{Error, ShapeMismatch};

/// A dense, row-major (batch, channels, height, width) tensor of `f32`.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor of the given shape filled with zeroes.
    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Wraps an existing buffer, or fails if its length doesn't match the
    /// shape.
    pub fn from_vec(shape: [usize; 4], data: Vec<f32>) -> Result<Self, Error> {
        let numel = shape.iter().product();
        if data.len() != numel {
            return Err(Error::BufferLength(numel, data.len()));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Contiguous (height * width) plane of one channel.
    pub(crate) fn plane(&self, n: usize, c: usize) -> &[f32] {
        let hw = self.shape[2] * self.shape[3];
        let start = (n * self.shape[1] + c) * hw;
        &self.data[start..start + hw]
    }

    pub(crate) fn plane_mut(&mut self, n: usize, c: usize) -> &mut [f32] {
        let hw = self.shape[2] * self.shape[3];
        let start = (n * self.shape[1] + c) * hw;
        &mut self.data[start..start + hw]
    }

    /// Clamps every element into `[min, max]` in place.
    pub fn clamp(&mut self, min: f32, max: f32) {
        for v in &mut self.data {
            *v = v.max(min).min(max);
        }
    }
}

pub(crate) fn check_same_shape(
    context: &'static str,
    expected: &Tensor,
    actual: &Tensor,
) -> Result<(), Error> {
    if expected.shape() != actual.shape() {
        return Err(Error::ShapeMismatch(ShapeMismatch {
            context,
            expected: expected.shape(),
            actual: actual.shape(),
        }));
    }
    Ok(())
}

/// Mean squared error with mean reduction.
pub(crate) fn mse(context: &'static str, a: &Tensor, b: &Tensor) -> Result<f32, Error> {
    check_same_shape(context, a, b)?;
    let mut sum = 0.0f32;
    for (x, y) in a.data().iter().zip(b.data().iter()) {
        let diff = x - y;
        sum += diff * diff;
    }
    Ok(sum / a.numel() as f32)
}

/// Gradient of `mse(a, b)` with respect to `a`, scaled by `weight`.
pub(crate) fn mse_grad(weight: f32, a: &Tensor, b: &Tensor) -> Tensor {
    let inv = weight * 2.0 / a.numel() as f32;
    let data = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(x, y)| (x - y) * inv)
        .collect();
    Tensor {
        shape: a.shape(),
        data,
    }
}

/// `acc += t`, used when folding probe gradients into the running gradient.
pub(crate) fn add_assign(acc: &mut Tensor, t: &Tensor) {
    debug_assert_eq!(acc.shape(), t.shape());
    for (a, b) in acc.data.iter_mut().zip(t.data.iter()) {
        *a += b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_checks_length() {
        assert!(Tensor::from_vec([1, 1, 2, 2], vec![0.0; 4]).is_ok());
        assert!(matches!(
            Tensor::from_vec([1, 1, 2, 2], vec![0.0; 5]),
            Err(Error::BufferLength(4, 5))
        ));
    }

    #[test]
    fn clamp_bounds_every_element() {
        let mut t = Tensor::from_vec([1, 1, 1, 4], vec![-0.5, 0.25, 1.5, 0.0]).unwrap();
        t.clamp(0.0, 1.0);
        assert_eq!(t.data(), &[0.0, 0.25, 1.0, 0.0]);
    }

    #[test]
    fn mse_forward_and_grad() {
        let a = Tensor::from_vec([1, 1, 1, 3], vec![0.5, -0.5, 1.0]).unwrap();
        let b = Tensor::from_vec([1, 1, 1, 3], vec![0.0, 0.0, 1.5]).unwrap();
        let value = mse("test", &a, &b).unwrap();
        assert!((value - 0.25).abs() < 1e-6);

        let grad = mse_grad(1.0, &a, &b);
        assert!(grad.data()[0] > 0.0);
        assert!(grad.data()[1] < 0.0);
        // d/da (1/n)Σ(a-b)^2 = 2(a-b)/n
        assert!((grad.data()[0] - 2.0 * 0.5 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn mse_rejects_shape_mismatch() {
        let a = Tensor::zeros([1, 1, 2, 2]);
        let b = Tensor::zeros([1, 2, 2, 2]);
        assert!(matches!(
            mse("test", &a, &b),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn planes_are_contiguous_channels() {
        let t = Tensor::from_vec([1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.plane(0, 0), &[1.0, 2.0]);
        assert_eq!(t.plane(0, 1), &[3.0, 4.0]);
    }
}
