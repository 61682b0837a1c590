use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) context: &'static str,
    pub(crate) expected: [usize; 4],
    pub(crate) actual: [usize; 4],
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected tensor shape {:?} but got {:?}",
            self.context, self.expected, self.actual
        )
    }
}

#[derive(Debug)]
pub struct UnrecognizedLayer {
    pub(crate) index: usize,
    pub(crate) op: &'static str,
}

impl fmt::Display for UnrecognizedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backbone layer #{} has kind '{}', which is not one of \
             convolution/activation/pooling/normalization",
            self.index, self.op
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// A tensor had a different shape than the operation expected
    ShapeMismatch(ShapeMismatch),
    /// A raw buffer's length didn't match the tensor shape it was meant to fill
    BufferLength(usize, usize),
    /// The backbone contains a layer the adapter cannot classify, so the
    /// measurement pipeline cannot be assembled from it
    UnrecognizedLayer(UnrecognizedLayer),
    /// A required input (backbone, style image, content image) was never
    /// given to the builder
    MissingInput(&'static str),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::BufferLength(expected, actual) => write!(
                f,
                "buffer of {} element(s) doesn't fill a tensor of {} element(s)",
                actual, expected
            ),
            Self::UnrecognizedLayer(ul) => write!(f, "{}", ul),
            Self::MissingInput(input) => {
                write!(f, "required input '{}' was not provided", input)
            }
            Self::Io(io) => write!(f, "{}", io),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}
