// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `style-transfer` is a light API for neural style transfer: it synthesizes
//! an image that keeps a content image's structure while adopting a style
//! image's texture statistics, by optimizing the pixels of a canvas against
//! loss probes spliced into a frozen convolutional feature extractor.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the
//! builder pattern. Calling `build` on the `SessionBuilder` loads both input
//! images and checks for various errors.
//!
//! `Session` has a `run()` method that assembles the loss-measuring pipeline
//! and iterates the optimizer, returning the result as a `StylizedImage`.
//!
//! You can save, stream, or inspect the image from `StylizedImage`.
//!
//! ## Usage
//! Session follows a "builder pattern" for defining parameters, meaning you
//! chain functions together.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! // The frozen feature extractor, loaded once per process
//! let backbone = Arc::new(style_transfer::Backbone::vgg19(0));
//!
//! // Create a new session with default parameters
//! let session = style_transfer::Session::builder()
//!     .backbone(backbone)
//!     // Specify the two input images
//!     .style_image(&"imgs/style.jpg")
//!     .content_image(&"imgs/content.jpg")
//!     // Set some parameters
//!     .num_steps(300)
//!     .style_weight(1e6)
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Synthesize the stylized image
//! let stylized = session.run(None).expect("transfer failed");
//!
//! // Save it to disk
//! stylized.save("stylized.png").expect("failed to save image");
//! ```

mod backbone;
pub mod conversation;
mod errors;
mod lbfgs;
mod model;
mod ops;
mod probes;
pub mod session;
mod tensor;
mod utils;

pub use image;
use std::path::Path;

pub use backbone::{Backbone, LayerKind, LayerOp};
pub use errors::Error;
pub use lbfgs::optimize;
pub use model::{assemble, Evaluation, Pipeline, DEFAULT_CONTENT_LAYERS, DEFAULT_STYLE_LAYERS};
pub use session::{stylize, Session, SessionBuilder, TransferProgress};
pub use tensor::Tensor;
pub use utils::{load_dynamic_image, ImageSource};

/// Simple dimensions struct
#[derive(Copy, Clone)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug)]
struct Parameters {
    num_steps: usize,
    style_weight: f32,
    content_weight: f32,
    image_size: u32,
    content_layers: Vec<String>,
    style_layers: Vec<String>,
    max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            num_steps: 300,
            style_weight: 1e6,
            content_weight: 1.0,
            image_size: 128,
            content_layers: DEFAULT_CONTENT_LAYERS.iter().map(|s| (*s).to_owned()).collect(),
            style_layers: DEFAULT_STYLE_LAYERS.iter().map(|s| (*s).to_owned()).collect(),
            max_thread_count: None,
        }
    }
}

/// An image synthesized by a `Session::run()`
pub struct StylizedImage {
    tensor: Tensor,
}

impl StylizedImage {
    /// Saves the stylized image to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        utils::tensor_to_image(&self.tensor)?.save(&path)?;
        Ok(())
    }

    /// Writes the stylized image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = self.into_image();
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// The raw (1, 3, H, W) canvas, already clamped into `[0, 1]`
    pub fn as_tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Returns the stylized output image
    pub fn into_image(self) -> image::DynamicImage {
        match utils::tensor_to_image(&self.tensor) {
            Ok(img) => image::DynamicImage::ImageRgb8(img),
            // the canvas shape is fixed at load time, so this can't happen
            Err(_) => unreachable!("stylized canvas always has shape (1, 3, h, w)"),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::{
        backbone::{Backbone, LayerOp},
        tensor::Tensor,
    };
    use rand::{Rng, SeedableRng};

    /// A vgg-shaped five-convolution backbone that is cheap enough for tests.
    pub(crate) fn small_backbone(seed: u64) -> Backbone {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
        let mut conv = |in_c: usize, out_c: usize| {
            let bound = (6.0 / (in_c as f32 * 9.0)).sqrt();
            LayerOp::Conv2d {
                in_channels: in_c,
                out_channels: out_c,
                kernel: 3,
                stride: 1,
                padding: 1,
                weight: (0..out_c * in_c * 9)
                    .map(|_| rng.gen_range(-bound..bound))
                    .collect(),
                bias: vec![0.0; out_c],
            }
        };

        Backbone::from_layers(vec![
            conv(3, 4),
            LayerOp::ReLU,
            conv(4, 4),
            LayerOp::ReLU,
            LayerOp::MaxPool2d {
                kernel: 2,
                stride: 2,
            },
            conv(4, 8),
            LayerOp::ReLU,
            conv(8, 8),
            LayerOp::ReLU,
            LayerOp::MaxPool2d {
                kernel: 2,
                stride: 2,
            },
            conv(8, 8),
            LayerOp::ReLU,
        ])
        .unwrap()
    }

    /// A deterministic 16x16 pseudo-image in `[0, 1]`.
    pub(crate) fn image(seed: f32) -> Tensor {
        let data = (0..3 * 16 * 16)
            .map(|v| (v as f32 * 0.13 + seed).sin() * 0.5 + 0.5)
            .collect();
        Tensor::from_vec([1, 3, 16, 16], data).unwrap()
    }
}
