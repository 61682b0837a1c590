//! Forward and backward kernels for the backbone layer kinds.
//!
//! The backbone weights are frozen, so backward passes only ever produce the
//! gradient with respect to the layer *input*; no weight gradients exist
//! anywhere in this crate.

use crate::{
    errors::{Error, ShapeMismatch},
    tensor::Tensor,
};

/// Runs `f` once per (batch, channel) plane of `out`, fanning the planes out
/// over up to `threads` scoped workers. `f` receives the flat plane index
/// (`n * channels + c`) and the plane's slice.
fn for_each_plane<F>(out: &mut [f32], plane_len: usize, threads: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    // for WASM we do not have threads and crossbeam panics, so run serially
    #[cfg(not(target_arch = "wasm32"))]
    {
        let plane_count = out.len() / plane_len.max(1);
        if threads > 1 && plane_count > 1 {
            let mut planes: Vec<(usize, &mut [f32])> =
                out.chunks_mut(plane_len).enumerate().collect();
            let per_worker = (planes.len() + threads - 1) / threads;

            let f = &f;
            crossbeam_utils::thread::scope(|scope| {
                for chunk in planes.chunks_mut(per_worker) {
                    scope.spawn(move |_| {
                        for (idx, plane) in chunk.iter_mut() {
                            f(*idx, plane);
                        }
                    });
                }
            })
            .unwrap();
            return;
        }
    }

    for (idx, plane) in out.chunks_mut(plane_len).enumerate() {
        f(idx, plane);
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn conv2d(
    x: &Tensor,
    weight: &[f32],
    bias: &[f32],
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    threads: usize,
) -> Result<Tensor, Error> {
    let [batch, channels, height, width] = x.shape();
    if channels != in_channels || height + 2 * padding < kernel || width + 2 * padding < kernel {
        return Err(Error::ShapeMismatch(ShapeMismatch {
            context: "convolution input",
            expected: [batch, in_channels, kernel, kernel],
            actual: x.shape(),
        }));
    }

    let out_h = (height + 2 * padding - kernel) / stride + 1;
    let out_w = (width + 2 * padding - kernel) / stride + 1;
    let mut out = Tensor::zeros([batch, out_channels, out_h, out_w]);

    for_each_plane(out.data_mut(), out_h * out_w, threads, |plane_idx, plane| {
        let n = plane_idx / out_channels;
        let oc = plane_idx % out_channels;

        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut acc = bias[oc];
                for ic in 0..in_channels {
                    let input = x.plane(n, ic);
                    let w_base = ((oc * in_channels + ic) * kernel) * kernel;
                    for ky in 0..kernel {
                        let iy = oy * stride + ky;
                        if iy < padding || iy - padding >= height {
                            continue;
                        }
                        let row = (iy - padding) * width;
                        for kx in 0..kernel {
                            let ix = ox * stride + kx;
                            if ix < padding || ix - padding >= width {
                                continue;
                            }
                            acc += weight[w_base + ky * kernel + kx] * input[row + ix - padding];
                        }
                    }
                }
                plane[oy * out_w + ox] = acc;
            }
        }
    });

    Ok(out)
}

/// Gradient of a convolution with respect to its input, gathered one input
/// channel plane at a time so planes parallelize without contention.
#[allow(clippy::too_many_arguments)]
pub(crate) fn conv2d_input_grad(
    grad_out: &Tensor,
    input_shape: [usize; 4],
    weight: &[f32],
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    threads: usize,
) -> Tensor {
    let [_, _, height, width] = input_shape;
    let [_, _, out_h, out_w] = grad_out.shape();
    let mut grad_in = Tensor::zeros(input_shape);

    for_each_plane(grad_in.data_mut(), height * width, threads, |plane_idx, plane| {
        let n = plane_idx / in_channels;
        let ic = plane_idx % in_channels;

        for oc in 0..out_channels {
            let grads = grad_out.plane(n, oc);
            let w_base = ((oc * in_channels + ic) * kernel) * kernel;
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let g = grads[oy * out_w + ox];
                    for ky in 0..kernel {
                        let iy = oy * stride + ky;
                        if iy < padding || iy - padding >= height {
                            continue;
                        }
                        let row = (iy - padding) * width;
                        for kx in 0..kernel {
                            let ix = ox * stride + kx;
                            if ix < padding || ix - padding >= width {
                                continue;
                            }
                            plane[row + ix - padding] += weight[w_base + ky * kernel + kx] * g;
                        }
                    }
                }
            }
        }
    });

    grad_in
}

pub(crate) fn relu(x: &Tensor) -> Tensor {
    let mut out = x.clone();
    for v in out.data_mut() {
        *v = v.max(0.0);
    }
    out
}

/// Masks the incoming gradient by the sign of the activation's input.
pub(crate) fn relu_grad(grad_out: &Tensor, input: &Tensor) -> Tensor {
    let mut grad = grad_out.clone();
    for (g, x) in grad.data_mut().iter_mut().zip(input.data()) {
        if *x <= 0.0 {
            *g = 0.0;
        }
    }
    grad
}

/// Max pooling. Returns the pooled tensor and, per output element, the flat
/// index of the winning input element within its plane, which the backward
/// pass scatters the gradient to.
pub(crate) fn max_pool2d(
    x: &Tensor,
    kernel: usize,
    stride: usize,
) -> Result<(Tensor, Vec<usize>), Error> {
    let [batch, channels, height, width] = x.shape();
    if height < kernel || width < kernel {
        return Err(Error::ShapeMismatch(ShapeMismatch {
            context: "max pool input",
            expected: [batch, channels, kernel, kernel],
            actual: x.shape(),
        }));
    }

    let out_h = (height - kernel) / stride + 1;
    let out_w = (width - kernel) / stride + 1;
    let mut out = Tensor::zeros([batch, channels, out_h, out_w]);
    let mut argmax = vec![0usize; batch * channels * out_h * out_w];

    for n in 0..batch {
        for c in 0..channels {
            let input = x.plane(n, c);
            let plane_base = (n * channels + c) * out_h * out_w;
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_idx = 0;
                    for ky in 0..kernel {
                        let row = (oy * stride + ky) * width;
                        for kx in 0..kernel {
                            let idx = row + ox * stride + kx;
                            if input[idx] > best {
                                best = input[idx];
                                best_idx = idx;
                            }
                        }
                    }
                    out.plane_mut(n, c)[oy * out_w + ox] = best;
                    argmax[plane_base + oy * out_w + ox] = best_idx;
                }
            }
        }
    }

    Ok((out, argmax))
}

pub(crate) fn max_pool2d_grad(
    grad_out: &Tensor,
    argmax: &[usize],
    input_shape: [usize; 4],
) -> Tensor {
    let mut grad_in = Tensor::zeros(input_shape);
    let [_, channels, out_h, out_w] = grad_out.shape();
    let out_plane = out_h * out_w;

    for (flat, g) in grad_out.data().iter().enumerate() {
        let plane_idx = flat / out_plane;
        let n = plane_idx / channels;
        let c = plane_idx % channels;
        grad_in.plane_mut(n, c)[argmax[flat]] += g;
    }

    grad_in
}

/// Inference-mode batch normalization with frozen statistics.
pub(crate) fn batch_norm(
    x: &Tensor,
    mean: &[f32],
    var: &[f32],
    weight: &[f32],
    bias: &[f32],
    eps: f32,
) -> Tensor {
    let mut out = x.clone();
    let [batch, channels, ..] = x.shape();
    for n in 0..batch {
        for c in 0..channels {
            let scale = weight[c] / (var[c] + eps).sqrt();
            let shift = bias[c] - mean[c] * scale;
            for v in out.plane_mut(n, c) {
                *v = *v * scale + shift;
            }
        }
    }
    out
}

pub(crate) fn batch_norm_grad(
    grad_out: &Tensor,
    var: &[f32],
    weight: &[f32],
    eps: f32,
) -> Tensor {
    let mut grad = grad_out.clone();
    let [batch, channels, ..] = grad_out.shape();
    for n in 0..batch {
        for c in 0..channels {
            let scale = weight[c] / (var[c] + eps).sqrt();
            for g in grad.plane_mut(n, c) {
                *g *= scale;
            }
        }
    }
    grad
}

/// Per-channel rescaling of raw pixels into the distribution the backbone
/// was trained on: `(x - mean) / std`.
pub(crate) fn normalize(x: &Tensor, mean: &[f32; 3], std: &[f32; 3]) -> Tensor {
    let mut out = x.clone();
    let [batch, channels, ..] = x.shape();
    for n in 0..batch {
        for c in 0..channels {
            let (m, s) = (mean[c], std[c]);
            for v in out.plane_mut(n, c) {
                *v = (*v - m) / s;
            }
        }
    }
    out
}

pub(crate) fn normalize_grad(grad_out: &Tensor, std: &[f32; 3]) -> Tensor {
    let mut grad = grad_out.clone();
    let [batch, channels, ..] = grad_out.shape();
    for n in 0..batch {
        for c in 0..channels {
            let s = std[c];
            for g in grad.plane_mut(n, c) {
                *g /= s;
            }
        }
    }
    grad
}
