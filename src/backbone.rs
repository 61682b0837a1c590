//! Adapter over the externally supplied, frozen feature extractor.
//!
//! The backbone is consumed as an ordered stack of layer descriptors. Each
//! descriptor is classified exactly once, at load time, into the structural
//! kind the assembler splices against, and named after a running convolution
//! counter: the Nth convolution is `conv_N`, and any activation, pooling or
//! normalization layer that follows it inherits `N` until the next
//! convolution.

use crate::errors::{Error, UnrecognizedLayer};
use rand::{Rng, SeedableRng};
use std::io::{Read, Write};

/// Structural kind of a backbone layer, computed once per layer when the
/// backbone is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Convolution,
    Activation,
    Pooling,
    Normalization,
}

/// A single layer of the supplied backbone.
///
/// Only the first four variants can appear in a measurement pipeline. The
/// remaining ones exist because image classifiers carry a prediction head;
/// handing one of those to [`Backbone::from_layers`] is a configuration
/// error, never something to silently skip.
#[derive(Debug, Clone)]
pub enum LayerOp {
    /// 2D convolution with an `out_channels * in_channels * kernel * kernel`
    /// weight buffer and one bias per output channel.
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        weight: Vec<f32>,
        bias: Vec<f32>,
    },
    /// Rectified linear activation. Always applied out-of-place so probes can
    /// observe both sides of it during backpropagation.
    ReLU,
    /// 2D max pooling.
    MaxPool2d { kernel: usize, stride: usize },
    /// Inference-mode batch normalization with frozen statistics.
    BatchNorm2d {
        channels: usize,
        mean: Vec<f32>,
        var: Vec<f32>,
        weight: Vec<f32>,
        bias: Vec<f32>,
        eps: f32,
    },
    /// Fully connected classifier layer. Not classifiable.
    Linear {
        in_features: usize,
        out_features: usize,
    },
    /// Dropout. Not classifiable.
    Dropout,
    /// Flatten. Not classifiable.
    Flatten,
}

impl LayerOp {
    fn kind(&self) -> Option<LayerKind> {
        match self {
            Self::Conv2d { .. } => Some(LayerKind::Convolution),
            Self::ReLU => Some(LayerKind::Activation),
            Self::MaxPool2d { .. } => Some(LayerKind::Pooling),
            Self::BatchNorm2d { .. } => Some(LayerKind::Normalization),
            Self::Linear { .. } | Self::Dropout | Self::Flatten => None,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "Conv2d",
            Self::ReLU => "ReLU",
            Self::MaxPool2d { .. } => "MaxPool2d",
            Self::BatchNorm2d { .. } => "BatchNorm2d",
            Self::Linear { .. } => "Linear",
            Self::Dropout => "Dropout",
            Self::Flatten => "Flatten",
        }
    }
}

/// A classified, named backbone layer.
#[derive(Debug)]
pub(crate) struct BackboneEntry {
    pub(crate) name: String,
    pub(crate) kind: LayerKind,
    pub(crate) op: LayerOp,
}

/// The frozen feature extractor, shared read-only across requests.
///
/// Weights are plain owned buffers with no interior mutability, so one
/// instance can back concurrent forward passes.
#[derive(Debug)]
pub struct Backbone {
    entries: Vec<BackboneEntry>,
}

const WEIGHTS_MAGIC: u32 = 0x5347_0001;

impl Backbone {
    /// Classifies and names the supplied layer stack.
    ///
    /// Fails with [`Error::UnrecognizedLayer`] on the first layer that isn't a
    /// convolution, activation, pooling, or normalization layer.
    pub fn from_layers(layers: Vec<LayerOp>) -> Result<Self, Error> {
        let mut entries = Vec::with_capacity(layers.len());
        let mut conv_count = 0usize;

        for (index, op) in layers.into_iter().enumerate() {
            let kind = op.kind().ok_or_else(|| {
                Error::UnrecognizedLayer(UnrecognizedLayer {
                    index,
                    op: op.describe(),
                })
            })?;

            let name = match kind {
                LayerKind::Convolution => {
                    conv_count += 1;
                    format!("conv_{}", conv_count)
                }
                LayerKind::Activation => format!("relu_{}", conv_count),
                LayerKind::Pooling => format!("pool_{}", conv_count),
                LayerKind::Normalization => format!("bn_{}", conv_count),
            };

            entries.push(BackboneEntry { name, kind, op });
        }

        Ok(Self { entries })
    }

    pub(crate) fn entries(&self) -> &[BackboneEntry] {
        &self.entries
    }

    /// Ordered (name, kind) view of the classified layers.
    pub fn layers(&self) -> impl Iterator<Item = (&str, LayerKind)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the VGG19 feature stack: five blocks of 3x3/pad-1 convolutions
    /// ([2, 2, 4, 4, 4] per block, [64, 128, 256, 512, 512] channels), each
    /// convolution followed by a `ReLU` and each block by a 2x2 max pool.
    ///
    /// Weights are Kaiming-uniform random from the given seed, which is
    /// enough for texture statistics and for tests; a real deployment fills
    /// in pretrained weights with [`Backbone::read_weights`].
    pub fn vgg19(seed: u64) -> Self {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
        let mut layers = Vec::new();
        let mut in_channels = 3;

        for (block_convs, out_channels) in &[(2, 64), (2, 128), (4, 256), (4, 512), (4, 512)] {
            for _ in 0..*block_convs {
                layers.push(conv3x3(&mut rng, in_channels, *out_channels));
                layers.push(LayerOp::ReLU);
                in_channels = *out_channels;
            }
            layers.push(LayerOp::MaxPool2d {
                kernel: 2,
                stride: 2,
            });
        }

        // The layout contains no unclassifiable ops, so this cannot fail
        match Self::from_layers(layers) {
            Ok(backbone) => backbone,
            Err(_) => unreachable!("vgg19 layout is fully classifiable"),
        }
    }

    /// Serializes every weight buffer in layer order, headed by a magic tag
    /// and the layer count, so a pretrained parameter dump can be shipped
    /// separately from the layout.
    pub fn write_weights<W: Write>(&self, w: &mut W) -> std::io::Result<usize> {
        let mut written = 0;

        written += write_u32s(w, &[WEIGHTS_MAGIC, self.entries.len() as u32])?;

        for entry in &self.entries {
            match &entry.op {
                LayerOp::Conv2d {
                    in_channels,
                    out_channels,
                    kernel,
                    weight,
                    bias,
                    ..
                } => {
                    written += write_u32s(
                        w,
                        &[*out_channels as u32, *in_channels as u32, *kernel as u32],
                    )?;
                    written += write_f32s(w, weight)?;
                    written += write_f32s(w, bias)?;
                }
                LayerOp::BatchNorm2d {
                    channels,
                    mean,
                    var,
                    weight,
                    bias,
                    ..
                } => {
                    written += write_u32s(w, &[*channels as u32])?;
                    for buf in &[mean, var, weight, bias] {
                        written += write_f32s(w, buf)?;
                    }
                }
                _ => {}
            }
        }

        Ok(written)
    }

    /// Fills this backbone's weight buffers from a dump produced by
    /// [`Backbone::write_weights`]. The layout (layer order and dimensions)
    /// must already match; mismatches are reported as `InvalidData`.
    pub fn read_weights<R: Read>(&mut self, r: &mut R) -> std::io::Result<()> {
        use std::io::{Error, ErrorKind};

        let mut header = [0u32; 2];
        read_u32s(r, &mut header)?;

        if header[0] != WEIGHTS_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "invalid magic"));
        }
        if header[1] as usize != self.entries.len() {
            return Err(Error::new(ErrorKind::InvalidData, "layer count mismatch"));
        }

        for entry in &mut self.entries {
            match &mut entry.op {
                LayerOp::Conv2d {
                    in_channels,
                    out_channels,
                    kernel,
                    weight,
                    bias,
                    ..
                } => {
                    let mut dims = [0u32; 3];
                    read_u32s(r, &mut dims)?;
                    if dims != [*out_channels as u32, *in_channels as u32, *kernel as u32] {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("dimension mismatch for {}", entry.name),
                        ));
                    }
                    read_f32s(r, weight)?;
                    read_f32s(r, bias)?;
                }
                LayerOp::BatchNorm2d {
                    channels,
                    mean,
                    var,
                    weight,
                    bias,
                    ..
                } => {
                    let mut dims = [0u32; 1];
                    read_u32s(r, &mut dims)?;
                    if dims[0] as usize != *channels {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("dimension mismatch for {}", entry.name),
                        ));
                    }
                    for buf in [mean, var, weight, bias] {
                        read_f32s(r, buf)?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// 3x3 stride-1 pad-1 convolution with Kaiming-uniform weights.
fn conv3x3<R: Rng>(rng: &mut R, in_channels: usize, out_channels: usize) -> LayerOp {
    let fan_in = (in_channels * 9) as f32;
    let bound = (6.0 / fan_in).sqrt();

    let weight = (0..out_channels * in_channels * 9)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();

    LayerOp::Conv2d {
        in_channels,
        out_channels,
        kernel: 3,
        stride: 1,
        padding: 1,
        weight,
        bias: vec![0.0; out_channels],
    }
}

fn write_u32s<W: Write>(w: &mut W, values: &[u32]) -> std::io::Result<usize> {
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(values.len() * 4)
}

fn read_u32s<R: Read>(r: &mut R, out: &mut [u32]) -> std::io::Result<()> {
    let mut bytes = [0u8; 4];
    for v in out {
        r.read_exact(&mut bytes)?;
        *v = u32::from_le_bytes(bytes);
    }
    Ok(())
}

fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> std::io::Result<usize> {
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(values.len() * 4)
}

fn read_f32s<R: Read>(r: &mut R, out: &mut [f32]) -> std::io::Result<()> {
    let mut bytes = [0u8; 4];
    for v in out {
        r.read_exact(&mut bytes)?;
        *v = f32::from_le_bytes(bytes);
    }
    Ok(())
}
