//! Loss probes spliced into the measurement pipeline.
//!
//! A probe observes the activation flowing past its position, stores a scalar
//! discrepancy against a target captured once at assembly time, and leaves
//! the activation untouched so later layers see the same values. The content
//! probe compares activations directly; the style probe compares their Gram
//! matrices, which capture texture statistics independent of spatial layout.

use crate::{
    errors::Error,
    tensor::{self, Tensor},
};

/// Pairwise correlation matrix of the flattened feature channels.
///
/// A (b, c, h, w) activation is flattened to (b*c, h*w) rows; the result is
/// the product of that matrix with its own transpose, divided by the total
/// element count so larger feature maps don't dominate purely by size.
/// Returned as a (1, 1, b*c, b*c) tensor.
pub(crate) fn gram_matrix(x: &Tensor) -> Tensor {
    let [batch, channels, height, width] = x.shape();
    let rows = batch * channels;
    let cols = height * width;
    let norm = (rows * cols) as f32;

    let mut gram = Tensor::zeros([1, 1, rows, rows]);
    let flat = x.data();
    for i in 0..rows {
        let row_i = &flat[i * cols..(i + 1) * cols];
        for j in i..rows {
            let row_j = &flat[j * cols..(j + 1) * cols];
            let dot: f32 = row_i.iter().zip(row_j.iter()).map(|(a, b)| a * b).sum();
            let value = dot / norm;
            gram.data_mut()[i * rows + j] = value;
            gram.data_mut()[j * rows + i] = value;
        }
    }

    gram
}

/// Measures mean-squared-error against a detached activation snapshot.
pub struct ContentProbe {
    target: Tensor,
    loss: f32,
}

impl ContentProbe {
    /// `target` is the activation of the content image at this position,
    /// captured once and never updated.
    pub(crate) fn new(target: Tensor) -> Self {
        Self { target, loss: 0.0 }
    }

    /// Refreshes the stored loss from the current activation.
    pub(crate) fn observe(&mut self, activation: &Tensor) -> Result<(), Error> {
        self.loss = tensor::mse("content probe", activation, &self.target)?;
        Ok(())
    }

    /// The most recently observed discrepancy.
    pub fn loss(&self) -> f32 {
        self.loss
    }

    /// Gradient of `weight * loss` with respect to the activation.
    pub(crate) fn grad(&self, activation: &Tensor, weight: f32) -> Tensor {
        tensor::mse_grad(weight, activation, &self.target)
    }
}

/// Measures mean-squared-error between Gram matrices.
pub struct StyleProbe {
    target: Tensor,
    loss: f32,
}

impl StyleProbe {
    /// `target` is the activation of the style image at this position; only
    /// its Gram matrix is kept.
    pub(crate) fn new(target: &Tensor) -> Self {
        Self {
            target: gram_matrix(target),
            loss: 0.0,
        }
    }

    pub(crate) fn observe(&mut self, activation: &Tensor) -> Result<(), Error> {
        let gram = gram_matrix(activation);
        self.loss = tensor::mse("style probe", &gram, &self.target)?;
        Ok(())
    }

    pub fn loss(&self) -> f32 {
        self.loss
    }

    /// Gradient of `weight * loss` with respect to the activation.
    ///
    /// With G = F F^T / (R N) and L the mean-squared Gram error over R^2
    /// entries, dL/dF works out to (4 w / (R^3 N)) (G - T) F, which is then
    /// reshaped back to the activation's layout.
    pub(crate) fn grad(&self, activation: &Tensor, weight: f32) -> Tensor {
        let [batch, channels, height, width] = activation.shape();
        let rows = batch * channels;
        let cols = height * width;

        let gram = gram_matrix(activation);
        let scale = weight * 4.0 / (rows * rows * rows * cols) as f32;

        let mut grad = Tensor::zeros(activation.shape());
        let flat = activation.data();
        for i in 0..rows {
            let out_row = &mut grad.data_mut()[i * cols..(i + 1) * cols];
            for j in 0..rows {
                let m = (gram.data()[i * rows + j] - self.target.data()[i * rows + j]) * scale;
                if m == 0.0 {
                    continue;
                }
                let row_j = &flat[j * cols..(j + 1) * cols];
                for (o, v) in out_row.iter_mut().zip(row_j.iter()) {
                    *o += m * v;
                }
            }
        }

        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activation() -> Tensor {
        let data = (0..2 * 3 * 4).map(|v| (v as f32 * 0.37).sin()).collect();
        Tensor::from_vec([1, 2, 3, 4], data).unwrap()
    }

    #[test]
    fn gram_is_symmetric() {
        let gram = gram_matrix(&activation());
        let [_, _, rows, cols] = gram.shape();
        assert_eq!(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                let a = gram.data()[i * cols + j];
                let b = gram.data()[j * cols + i];
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn gram_normalizes_by_element_count() {
        // all-ones activation: every dot product is h*w, so every gram entry
        // is h*w / (c*h*w) = 1/c
        let x = Tensor::from_vec([1, 2, 2, 2], vec![1.0; 8]).unwrap();
        let gram = gram_matrix(&x);
        assert!(gram.data().iter().all(|v| (*v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn content_loss_zero_at_target() {
        let target = activation();
        let mut probe = ContentProbe::new(target.clone());
        probe.observe(&target).unwrap();
        assert_eq!(probe.loss(), 0.0);

        let mut other = target.clone();
        other.data_mut()[0] += 1.0;
        probe.observe(&other).unwrap();
        assert!(probe.loss() > 0.0);
    }

    #[test]
    fn style_loss_zero_for_matching_statistics() {
        let target = activation();
        let mut probe = StyleProbe::new(&target);
        probe.observe(&target).unwrap();
        assert!(probe.loss() < 1e-10);
    }

    #[test]
    fn style_grad_matches_finite_difference() {
        let target = activation();
        let probe = StyleProbe::new(&target);

        let mut x = activation();
        for v in x.data_mut() {
            *v += 0.1;
        }
        let grad = probe.grad(&x, 1.0);

        let loss_of = |t: &Tensor| {
            let gram = gram_matrix(t);
            tensor::mse("test", &gram, &gram_matrix(&target)).unwrap()
        };

        let h = 1e-3;
        for idx in [0usize, 7, 13, 23] {
            let mut plus = x.clone();
            plus.data_mut()[idx] += h;
            let mut minus = x.clone();
            minus.data_mut()[idx] -= h;
            let expected = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
            assert!(
                (grad.data()[idx] - expected).abs() < 1e-3,
                "grad[{}] = {}, finite difference = {}",
                idx,
                grad.data()[idx],
                expected
            );
        }
    }

    #[test]
    fn content_grad_matches_finite_difference() {
        let target = activation();
        let probe = ContentProbe::new(target.clone());

        let mut x = activation();
        for v in x.data_mut() {
            *v = *v * 0.5 + 0.2;
        }
        let grad = probe.grad(&x, 2.0);

        let h = 1e-3;
        let mut plus = x.clone();
        plus.data_mut()[5] += h;
        let mut minus = x.clone();
        minus.data_mut()[5] -= h;
        let lp = 2.0 * tensor::mse("t", &plus, &target).unwrap();
        let lm = 2.0 * tensor::mse("t", &minus, &target).unwrap();
        let expected = (lp - lm) / (2.0 * h);
        assert!((grad.data()[5] - expected).abs() < 1e-3);
    }
}
