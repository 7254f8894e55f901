use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImageGenError>;

/// Failure of a diffusion run or of moving weights on/off the device
#[derive(Error, Debug)]
pub enum ImageGenError {
    /// Rejected before touching the device
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Weight download failed: {0}")]
    HfHub(String),

    #[error("Tokenizer failed: {0}")]
    Tokenization(String),

    #[error("Device error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Image encoding failed: {0}")]
    ImageProcessing(String),
}

impl ImageGenError {
    /// True when retrying the same config can never succeed
    pub fn is_caller_error(&self) -> bool {
        matches!(self, ImageGenError::InvalidConfig(_))
    }
}

impl From<image::ImageError> for ImageGenError {
    fn from(err: image::ImageError) -> Self {
        ImageGenError::ImageProcessing(err.to_string())
    }
}
