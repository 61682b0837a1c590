//! Assembles the spliced measurement pipeline: pixel normalization, the
//! backbone's layers in their original order, and loss probes inserted
//! immediately after the requested layers. Everything after the last probe is
//! dead weight for optimization and is dropped.

use crate::{
    backbone::{Backbone, LayerOp},
    errors::Error,
    ops,
    probes::{ContentProbe, StyleProbe},
    tensor::{self, Tensor},
};

/// Per-channel statistics the backbone expects its input rescaled to.
pub(crate) const PIXEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub(crate) const PIXEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Content probes go after the 4th convolution by default.
pub const DEFAULT_CONTENT_LAYERS: &[&str] = &["conv_4"];
/// Style probes go after each of the first 5 convolutions by default.
pub const DEFAULT_STYLE_LAYERS: &[&str] = &["conv_1", "conv_2", "conv_3", "conv_4", "conv_5"];

enum StageOp<'b> {
    Normalize,
    Layer(&'b LayerOp),
    Content(ContentProbe),
    Style(StyleProbe),
}

struct Stage<'b> {
    name: String,
    op: StageOp<'b>,
}

/// Activations recorded by one forward pass, consumed by the backward pass.
struct StageCache {
    input: Tensor,
    argmax: Option<Vec<usize>>,
}

/// Everything one evaluation of the pipeline produces: the weighted total,
/// the per-category scores, and the gradient at the canvas.
pub struct Evaluation {
    pub total: f32,
    pub style_score: f32,
    pub content_score: f32,
    pub grad: Tensor,
}

/// The spliced evaluation pipeline for one request.
///
/// Borrows the shared backbone read-only; all mutable state (probe losses)
/// is request-scoped, so concurrent requests each assemble their own.
pub struct Pipeline<'b> {
    stages: Vec<Stage<'b>>,
    threads: usize,
}

impl<'b> Pipeline<'b> {
    /// Runs `x` through every stage, refreshing each probe's stored loss as a
    /// side effect, and returns the final activation.
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor, Error> {
        let (out, _) = self.forward_inner(x, false)?;
        Ok(out)
    }

    /// One full forward/backward evaluation of the weighted loss at `canvas`.
    pub fn evaluate(
        &mut self,
        canvas: &Tensor,
        style_weight: f32,
        content_weight: f32,
    ) -> Result<Evaluation, Error> {
        let (output, caches) = self.forward_inner(canvas, true)?;

        let style_score = self.style_score();
        let content_score = self.content_score();

        // The pipeline is truncated at the last probe, so the gradient seed
        // past it is zero; each probe folds its own weighted term in on the
        // way back.
        let mut grad = Tensor::zeros(output.shape());
        for (stage, cache) in self.stages.iter().zip(caches.iter()).rev() {
            grad = match &stage.op {
                StageOp::Normalize => ops::normalize_grad(&grad, &PIXEL_STD),
                StageOp::Layer(op) => match op {
                    LayerOp::Conv2d {
                        in_channels,
                        out_channels,
                        kernel,
                        stride,
                        padding,
                        weight,
                        ..
                    } => ops::conv2d_input_grad(
                        &grad,
                        cache.input.shape(),
                        weight,
                        *in_channels,
                        *out_channels,
                        *kernel,
                        *stride,
                        *padding,
                        self.threads,
                    ),
                    LayerOp::ReLU => ops::relu_grad(&grad, &cache.input),
                    LayerOp::MaxPool2d { .. } => {
                        let argmax = cache
                            .argmax
                            .as_deref()
                            .expect("pool stage always caches its argmax");
                        ops::max_pool2d_grad(&grad, argmax, cache.input.shape())
                    }
                    LayerOp::BatchNorm2d {
                        var, weight, eps, ..
                    } => ops::batch_norm_grad(&grad, var, weight, *eps),
                    LayerOp::Linear { .. } | LayerOp::Dropout | LayerOp::Flatten => {
                        unreachable!("unclassifiable ops are rejected at backbone load")
                    }
                },
                StageOp::Content(probe) => {
                    let mut g = probe.grad(&cache.input, content_weight);
                    tensor::add_assign(&mut g, &grad);
                    g
                }
                StageOp::Style(probe) => {
                    let mut g = probe.grad(&cache.input, style_weight);
                    tensor::add_assign(&mut g, &grad);
                    g
                }
            };
        }

        Ok(Evaluation {
            total: style_score * style_weight + content_score * content_weight,
            style_score,
            content_score,
            grad,
        })
    }

    /// Sum of every style probe's most recent loss. Exactly 0 when no style
    /// layer matched during assembly.
    pub fn style_score(&self) -> f32 {
        self.stages
            .iter()
            .filter_map(|s| match &s.op {
                StageOp::Style(p) => Some(p.loss()),
                _ => None,
            })
            .sum()
    }

    /// Sum of every content probe's most recent loss. Exactly 0 when no
    /// content layer matched during assembly.
    pub fn content_score(&self) -> f32 {
        self.stages
            .iter()
            .filter_map(|s| match &s.op {
                StageOp::Content(p) => Some(p.loss()),
                _ => None,
            })
            .sum()
    }

    pub fn style_probe_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.op, StageOp::Style(_)))
            .count()
    }

    pub fn content_probe_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.op, StageOp::Content(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in order, eg `["normalization", "conv_1", "style_loss_1", ..]`.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    fn forward_inner(
        &mut self,
        x: &Tensor,
        keep_caches: bool,
    ) -> Result<(Tensor, Vec<StageCache>), Error> {
        let threads = self.threads;
        let mut caches = Vec::with_capacity(if keep_caches { self.stages.len() } else { 0 });
        let mut current = x.clone();

        for stage in &mut self.stages {
            let mut argmax = None;
            let next = match &mut stage.op {
                StageOp::Normalize => ops::normalize(&current, &PIXEL_MEAN, &PIXEL_STD),
                StageOp::Layer(op) => match op {
                    LayerOp::Conv2d {
                        in_channels,
                        out_channels,
                        kernel,
                        stride,
                        padding,
                        weight,
                        bias,
                    } => ops::conv2d(
                        &current,
                        weight,
                        bias,
                        *in_channels,
                        *out_channels,
                        *kernel,
                        *stride,
                        *padding,
                        threads,
                    )?,
                    LayerOp::ReLU => ops::relu(&current),
                    LayerOp::MaxPool2d { kernel, stride } => {
                        let (out, indices) = ops::max_pool2d(&current, *kernel, *stride)?;
                        argmax = Some(indices);
                        out
                    }
                    LayerOp::BatchNorm2d {
                        mean,
                        var,
                        weight,
                        bias,
                        eps,
                        ..
                    } => ops::batch_norm(&current, mean, var, weight, bias, *eps),
                    LayerOp::Linear { .. } | LayerOp::Dropout | LayerOp::Flatten => {
                        unreachable!("unclassifiable ops are rejected at backbone load")
                    }
                },
                // Probes report and pass the activation through unchanged
                StageOp::Content(probe) => {
                    probe.observe(&current)?;
                    current.clone()
                }
                StageOp::Style(probe) => {
                    probe.observe(&current)?;
                    current.clone()
                }
            };

            if keep_caches {
                caches.push(StageCache {
                    input: std::mem::replace(&mut current, next),
                    argmax,
                });
            } else {
                current = next;
            }
        }

        Ok((current, caches))
    }
}

/// Builds the loss-measuring pipeline for one request.
///
/// Both reference images are pushed through the pipeline-so-far whenever a
/// requested layer is appended, and the detached result becomes that probe's
/// target. A requested layer name that never matches any backbone layer
/// simply yields no probe for it; the corresponding loss term is then zero
/// for the whole optimization, which callers may want to flag.
pub fn assemble<'b>(
    backbone: &'b Backbone,
    style: &Tensor,
    content: &Tensor,
    content_layers: &[&str],
    style_layers: &[&str],
    threads: usize,
) -> Result<Pipeline<'b>, Error> {
    let mut pipeline = Pipeline {
        stages: vec![Stage {
            name: "normalization".to_owned(),
            op: StageOp::Normalize,
        }],
        threads,
    };

    // Index of the last probe stage, recorded as we go so the dead tail can
    // be dropped without a second reverse scan.
    let mut last_probe = None;

    for entry in backbone.entries() {
        pipeline.stages.push(Stage {
            name: entry.name.clone(),
            op: StageOp::Layer(&entry.op),
        });

        // "conv_4" -> "4"; probes inherit the conv counter of their layer
        let counter = entry.name.rsplit('_').next().unwrap_or("0").to_owned();

        if content_layers.contains(&entry.name.as_str()) {
            let target = pipeline.forward(content)?;
            pipeline.stages.push(Stage {
                name: format!("content_loss_{}", counter),
                op: StageOp::Content(ContentProbe::new(target)),
            });
            last_probe = Some(pipeline.stages.len() - 1);
        }

        if style_layers.contains(&entry.name.as_str()) {
            let target = pipeline.forward(style)?;
            pipeline.stages.push(Stage {
                name: format!("style_loss_{}", counter),
                op: StageOp::Style(StyleProbe::new(&target)),
            });
            last_probe = Some(pipeline.stages.len() - 1);
        }
    }

    // Drop every backbone layer past the last probe; with no probe at all
    // only the normalization stage remains.
    pipeline.stages.truncate(last_probe.map_or(1, |i| i + 1));

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{image, small_backbone};

    #[test]
    fn pipeline_starts_with_normalization_and_ends_with_a_probe() {
        let backbone = small_backbone(1);
        let pipeline = assemble(
            &backbone,
            &image(0.0),
            &image(1.0),
            DEFAULT_CONTENT_LAYERS,
            DEFAULT_STYLE_LAYERS,
            1,
        )
        .unwrap();

        let names = pipeline.stage_names();
        assert_eq!(names[0], "normalization");
        assert!(names.last().unwrap().starts_with("style_loss_")
            || names.last().unwrap().starts_with("content_loss_"));
        assert_eq!(pipeline.style_probe_count(), 5);
        assert_eq!(pipeline.content_probe_count(), 1);
    }

    #[test]
    fn trailing_layers_are_dropped() {
        let backbone = small_backbone(2);
        // probes only after conv_1: everything past it must be gone
        let pipeline = assemble(&backbone, &image(0.0), &image(1.0), &[], &["conv_1"], 1).unwrap();
        assert_eq!(
            pipeline.stage_names(),
            ["normalization", "conv_1", "style_loss_1"]
        );
    }

    #[test]
    fn unmatched_layer_names_degrade_to_empty_probe_lists() {
        let backbone = small_backbone(3);
        let mut pipeline = assemble(
            &backbone,
            &image(0.0),
            &image(1.0),
            &["conv_99"],
            &["conv_1", "conv_2"],
            1,
        )
        .unwrap();

        assert_eq!(pipeline.content_probe_count(), 0);
        pipeline.forward(&image(2.0)).unwrap();
        assert_eq!(pipeline.content_score(), 0.0);
        assert!(pipeline.style_score() > 0.0);
    }

    #[test]
    fn no_matches_leaves_only_normalization() {
        let backbone = small_backbone(4);
        let pipeline =
            assemble(&backbone, &image(0.0), &image(1.0), &["nope"], &["never"], 1).unwrap();
        assert_eq!(pipeline.stage_names(), ["normalization"]);
    }

    #[test]
    fn probe_losses_vanish_on_their_own_reference() {
        let backbone = small_backbone(5);
        let content = image(0.0);
        let style = image(1.0);
        let mut pipeline = assemble(
            &backbone,
            &style,
            &content,
            DEFAULT_CONTENT_LAYERS,
            DEFAULT_STYLE_LAYERS,
            1,
        )
        .unwrap();

        pipeline.forward(&content).unwrap();
        assert!(pipeline.content_score() < 1e-10);

        pipeline.forward(&style).unwrap();
        assert!(pipeline.style_score() < 1e-8);
    }

    #[test]
    fn evaluate_gradient_matches_finite_difference() {
        let backbone = small_backbone(6);
        let content = image(0.0);
        let style = image(1.0);
        let mut pipeline = assemble(
            &backbone,
            &style,
            &content,
            &["conv_2"],
            &["conv_1", "conv_3"],
            1,
        )
        .unwrap();

        let canvas = image(0.5);
        let (sw, cw) = (10.0, 1.0);
        let eval = pipeline.evaluate(&canvas, sw, cw).unwrap();

        let h = 1e-3;
        for idx in [10usize, 100, 500] {
            let mut plus = canvas.clone();
            plus.data_mut()[idx] += h;
            let mut minus = canvas.clone();
            minus.data_mut()[idx] -= h;
            let lp = pipeline.evaluate(&plus, sw, cw).unwrap().total;
            let lm = pipeline.evaluate(&minus, sw, cw).unwrap().total;
            let expected = (lp - lm) / (2.0 * h);
            assert!(
                (eval.grad.data()[idx] - expected).abs() < 2e-2 * expected.abs().max(1.0),
                "grad[{}] = {}, finite difference = {}",
                idx,
                eval.grad.data()[idx],
                expected
            );
        }
    }
}
