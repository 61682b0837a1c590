use crate::{tensor::Tensor, Dims, Error};
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the pipeline
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Decodes an image, resizes it to `size`, and lays it out as a
/// (1, 3, height, width) tensor of `[0, 1]` floats, which is the only pixel
/// representation the measurement pipeline understands.
pub(crate) fn load_image(src: ImageSource<'_>, size: Dims) -> Result<Tensor, Error> {
    let img = load_dynamic_image(src)?;

    use image::GenericImageView;
    let img = if img.width() != size.width || img.height() != size.height {
        image::imageops::resize(
            &img.to_rgb8(),
            size.width,
            size.height,
            image::imageops::CatmullRom,
        )
    } else {
        img.to_rgb8()
    };

    let (width, height) = (size.width as usize, size.height as usize);
    let mut data = vec![0.0f32; 3 * width * height];
    for (x, y, pixel) in img.enumerate_pixels() {
        let spatial = y as usize * width + x as usize;
        for c in 0..3 {
            data[c * height * width + spatial] = f32::from(pixel[c]) / 255.0;
        }
    }

    Tensor::from_vec([1, 3, height, width], data)
}

/// Converts a (1, 3, H, W) tensor back into an 8-bit RGB image, dropping the
/// batch dimension. Values are expected to already be clamped to `[0, 1]`.
pub(crate) fn tensor_to_image(tensor: &Tensor) -> Result<image::RgbImage, Error> {
    let [batch, channels, height, width] = tensor.shape();
    if batch != 1 || channels != 3 {
        return Err(Error::ShapeMismatch(crate::errors::ShapeMismatch {
            context: "image conversion",
            expected: [1, 3, height, width],
            actual: tensor.shape(),
        }));
    }

    let mut img = image::RgbImage::new(width as u32, height as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let spatial = y as usize * width + x as usize;
        for c in 0..3 {
            let v = tensor.data()[c * height * width + spatial];
            pixel[c] = (v * 255.0).round().max(0.0).min(255.0) as u8;
        }
    }

    Ok(img)
}
