//! Second-order optimization of the canvas pixels.
//!
//! Limited-memory BFGS with the classic two-loop recursion, driven one
//! evaluation per iteration: clamp the canvas, run it through the pipeline,
//! fold the weighted probe gradients back to the pixels, and move along the
//! curvature-corrected direction. The step counter is loop-local and passed
//! through explicitly; there is no hidden state inside the evaluation.
//!
//! There are deliberately no NaN/Inf guards here: if the optimization
//! diverges, the output is whatever the final clamp makes of it, matching
//! the source behavior of this algorithm family.

use crate::{
    errors::Error,
    model::Pipeline,
    session::{ProgressUpdate, TransferProgress},
    tensor::Tensor,
};
use std::collections::VecDeque;

/// How many (s, y) curvature pairs the optimizer remembers.
const HISTORY: usize = 10;
/// Base step length. The very first step is additionally scaled down by the
/// gradient's l1 norm so a hot start cannot overshoot.
const LEARNING_RATE: f32 = 1.0;
/// Curvature pairs with s.y below this are discarded as numerically useless.
const CURVATURE_EPS: f32 = 1e-10;

/// Iteratively mutates `canvas` toward minimal weighted probe loss.
///
/// Runs `num_steps + 1` evaluations: the counter goes from 0 to `num_steps`
/// inclusive, so even `num_steps = 0` performs one forward/backward pass and
/// one update. The canvas is clamped into `[0, 1]` before every evaluation
/// and once more after the loop, since the last update lands unclamped.
pub fn optimize(
    pipeline: &mut Pipeline<'_>,
    mut canvas: Tensor,
    num_steps: usize,
    style_weight: f32,
    content_weight: f32,
    mut progress: Option<Box<dyn TransferProgress>>,
) -> Result<Tensor, Error> {
    let mut history: VecDeque<CurvaturePair> = VecDeque::with_capacity(HISTORY);
    let mut previous: Option<Previous> = None;

    let mut step = 0usize;
    while step <= num_steps {
        canvas.clamp(0.0, 1.0);

        let eval = pipeline.evaluate(&canvas, style_weight, content_weight)?;
        let grad = eval.grad.into_vec();

        if let Some(prev) = previous.take() {
            let y: Vec<f32> = grad
                .iter()
                .zip(prev.grad.iter())
                .map(|(g, pg)| g - pg)
                .collect();
            let sy = dot(&prev.step, &y);
            if sy > CURVATURE_EPS {
                if history.len() == HISTORY {
                    history.pop_front();
                }
                history.push_back(CurvaturePair {
                    s: prev.step,
                    y,
                    rho: 1.0 / sy,
                });
            }
        }

        let direction = descent_direction(&history, &grad);

        let length = if step == 0 {
            let l1: f32 = grad.iter().map(|g| g.abs()).sum();
            (1.0 / l1).min(1.0) * LEARNING_RATE
        } else {
            LEARNING_RATE
        };

        let taken: Vec<f32> = direction.iter().map(|d| d * length).collect();
        for (x, t) in canvas.data_mut().iter_mut().zip(taken.iter()) {
            *x += t;
        }

        if let Some(ref mut progress) = progress {
            progress.update(ProgressUpdate {
                step,
                total_steps: num_steps,
                total_loss: eval.total,
                style_score: eval.style_score,
                content_score: eval.content_score,
            });
        }

        previous = Some(Previous { grad, step: taken });
        step += 1;
    }

    canvas.clamp(0.0, 1.0);
    Ok(canvas)
}

struct CurvaturePair {
    s: Vec<f32>,
    y: Vec<f32>,
    rho: f32,
}

struct Previous {
    grad: Vec<f32>,
    step: Vec<f32>,
}

/// Two-loop recursion: applies the implicit inverse-Hessian approximation to
/// the gradient and negates it.
fn descent_direction(history: &VecDeque<CurvaturePair>, grad: &[f32]) -> Vec<f32> {
    let mut q: Vec<f32> = grad.to_vec();
    let mut alphas = Vec::with_capacity(history.len());

    for pair in history.iter().rev() {
        let alpha = pair.rho * dot(&pair.s, &q);
        for (qi, yi) in q.iter_mut().zip(pair.y.iter()) {
            *qi -= alpha * yi;
        }
        alphas.push(alpha);
    }

    // Initial Hessian scaling from the most recent pair
    if let Some(last) = history.back() {
        let gamma = dot(&last.s, &last.y) / dot(&last.y, &last.y);
        for qi in q.iter_mut() {
            *qi *= gamma;
        }
    }

    for (pair, alpha) in history.iter().zip(alphas.iter().rev()) {
        let beta = pair.rho * dot(&pair.y, &q);
        for (qi, si) in q.iter_mut().zip(pair.s.iter()) {
            *qi += (alpha - beta) * si;
        }
    }

    for qi in q.iter_mut() {
        *qi = -*qi;
    }
    q
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
