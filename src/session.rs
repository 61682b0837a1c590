use crate::*;
use std::sync::Arc;

/// Style transfer session.
///
/// Calling `run()` assembles a fresh measurement pipeline from the shared
/// backbone and the two loaded images, then optimizes a copy of the content
/// image against it, consuming the session in the process. You can provide a
/// `TransferProgress` implementation to get per-step loss updates.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
///
/// let backbone = Arc::new(style_transfer::Backbone::vgg19(0));
/// let session = style_transfer::Session::builder()
///     .backbone(backbone)
///     .style_image(&"imgs/style.jpg")
///     .content_image(&"imgs/content.jpg")
///     .build().expect("failed to build session");
///
/// let stylized = session.run(None).expect("transfer failed");
/// stylized.save("out/stylized.jpg").expect("failed to save image");
/// ```
#[derive(Debug)]
pub struct Session {
    backbone: Arc<Backbone>,
    style: Tensor,
    content: Tensor,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// Runs the optimization and returns the stylized image.
    ///
    /// Blocks the calling thread until the fixed step count has run out;
    /// there is no cancellation.
    pub fn run(self, progress: Option<Box<dyn TransferProgress>>) -> Result<StylizedImage, Error> {
        let threads = self
            .params
            .max_thread_count
            .unwrap_or_else(num_cpus::get);

        let content_layers: Vec<&str> =
            self.params.content_layers.iter().map(String::as_str).collect();
        let style_layers: Vec<&str> =
            self.params.style_layers.iter().map(String::as_str).collect();

        let mut pipeline = model::assemble(
            &self.backbone,
            &self.style,
            &self.content,
            &content_layers,
            &style_layers,
            threads,
        )?;

        // The canvas starts as a pixel-wise copy of the content image
        let canvas = lbfgs::optimize(
            &mut pipeline,
            self.content.clone(),
            self.params.num_steps,
            self.params.style_weight,
            self.params.content_weight,
            progress,
        )?;

        Ok(StylizedImage { tensor: canvas })
    }
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` will load and check all of the provided inputs to verify that the
/// transfer can run
#[derive(Default)]
pub struct SessionBuilder<'a> {
    backbone: Option<Arc<Backbone>>,
    style: Option<ImageSource<'a>>,
    content: Option<ImageSource<'a>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The frozen feature extractor to measure losses against. Shared;
    /// several sessions can hold the same instance.
    pub fn backbone(mut self, backbone: Arc<Backbone>) -> Self {
        self.backbone = Some(backbone);
        self
    }

    /// The image whose texture statistics the output should adopt.
    pub fn style_image<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// The image whose structure the output should preserve.
    pub fn content_image<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// Side length both input images are resized to.
    ///
    /// Default: 128
    pub fn image_size(mut self, size: u32) -> Self {
        self.params.image_size = size;
        self
    }

    /// Number of optimizer steps. The canvas is evaluated once per step plus
    /// once for the initial state.
    ///
    /// Default: 300
    pub fn num_steps(mut self, steps: usize) -> Self {
        self.params.num_steps = steps;
        self
    }

    /// Weight of the summed style probe losses in the total.
    ///
    /// Default: 1e6
    pub fn style_weight(mut self, weight: f32) -> Self {
        self.params.style_weight = weight;
        self
    }

    /// Weight of the summed content probe losses in the total.
    ///
    /// Default: 1
    pub fn content_weight(mut self, weight: f32) -> Self {
        self.params.content_weight = weight;
        self
    }

    /// Which backbone layers get a content probe after them.
    ///
    /// Default: `["conv_4"]`
    pub fn content_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, names: I) -> Self {
        self.params.content_layers = names.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Which backbone layers get a style probe after them.
    ///
    /// Default: `["conv_1", "conv_2", "conv_3", "conv_4", "conv_5"]`
    pub fn style_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, names: I) -> Self {
        self.params.style_layers = names.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Controls the maximum number of threads the convolution kernels will
    /// fan out over.
    ///
    /// Setting this number to `1` will result in completely deterministic
    /// output, meaning that redoing a transfer with the same inputs will
    /// always give you the same result.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or
    /// input images were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let backbone = self
            .backbone
            .ok_or(Error::MissingInput("backbone"))?;
        let style_src = self.style.ok_or(Error::MissingInput("style image"))?;
        let content_src = self.content.ok_or(Error::MissingInput("content image"))?;

        let size = Dims::square(self.params.image_size);
        let style = utils::load_image(style_src, size)?;
        let content = utils::load_image(content_src, size)?;

        Ok(Session {
            backbone,
            style,
            content,
            params: self.params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        if self.params.style_weight < 0.0 || !self.params.style_weight.is_finite() {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f32::MAX,
                value: self.params.style_weight,
                name: "style-weight",
            }));
        }

        if self.params.content_weight < 0.0 || !self.params.content_weight.is_finite() {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f32::MAX,
                value: self.params.content_weight,
                name: "content-weight",
            }));
        }

        if self.params.image_size == 0 || self.params.image_size > 4096 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: 4096.0,
                value: self.params.image_size as f32,
                name: "image-size",
            }));
        }

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        Ok(())
    }
}

/// Runs a whole transfer with default parameters: load both files, optimize,
/// save the result. This is the surface a messaging front end calls once its
/// conversation has collected both paths.
pub fn stylize<P: AsRef<std::path::Path>>(
    backbone: Arc<Backbone>,
    style_path: P,
    content_path: P,
    output_path: P,
) -> Result<(), Error> {
    let stylized = Session::builder()
        .backbone(backbone)
        .style_image(&style_path)
        .content_image(&content_path)
        .build()?
        .run(None)?;

    stylized.save(output_path)
}

/// Per-step information passed to external callers during optimization
pub struct ProgressUpdate {
    /// The evaluation counter, 0 through `total_steps` inclusive
    pub step: usize,
    /// The configured step count
    pub total_steps: usize,
    /// The weighted sum the optimizer is descending
    pub total_loss: f32,
    /// Sum of all style probe losses, unweighted
    pub style_score: f32,
    /// Sum of all content probe losses, unweighted
    pub content_score: f32,
}

/// Allows the optimizer to update external callers with the current
/// progress of the transfer
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate) + Send,
{
    fn update(&mut self, info: ProgressUpdate) {
        self(info)
    }
}
