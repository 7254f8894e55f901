// imagent - local image synthesis
// Runs Stable Diffusion in-process via Candle and keeps the loaded weights
// resident on the device between calls until told to release them.

mod stable_diffusion;

pub mod error;

pub use error::{ImageGenError, Result};
pub use stable_diffusion::{StableDiffusionGenerator, StableDiffusionVersion};

use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Configuration for image generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenConfig {
    /// Text prompt describing the image to generate
    pub prompt: String,

    /// Concepts to steer away from (empty for plain unconditional guidance)
    #[serde(default)]
    pub negative_prompt: String,

    /// Width of the generated image (must be multiple of 8)
    pub width: usize,

    /// Height of the generated image (must be multiple of 8)
    pub height: usize,

    /// Number of inference steps (more steps = better quality but slower)
    pub num_steps: usize,

    /// Random seed for reproducibility (None for random)
    pub seed: Option<u64>,
}

impl Default for ImageGenConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 512,
            height: 512,
            num_steps: 10,
            seed: None,
        }
    }
}

impl ImageGenConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = negative.into();
        self
    }

    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    /// Check the shape constraints shared by every backend
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ImageGenError::InvalidConfig(
                "Width and height must be non-zero".into(),
            ));
        }
        if self.width % 8 != 0 || self.height % 8 != 0 {
            return Err(ImageGenError::InvalidConfig(
                "Width and height must be multiples of 8".into(),
            ));
        }
        if self.num_steps == 0 {
            return Err(ImageGenError::InvalidConfig(
                "At least one inference step is required".into(),
            ));
        }
        Ok(())
    }
}

/// Result of image generation
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    /// Image data as RGB bytes
    pub data: Vec<u8>,

    /// Image width
    pub width: u32,

    /// Image height
    pub height: u32,

    /// Prompt used to generate the image
    pub prompt: String,

    /// Seed used for generation
    pub seed: u64,
}

impl GeneratedImage {
    fn to_rgb(&self) -> Result<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| ImageGenError::ImageProcessing("Failed to create image buffer".into()))
    }

    /// Encode the image as PNG bytes
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(self.to_rgb()?)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }
}

/// Trait for image generation backends
pub trait ImageGenerator {
    /// Generate an image from the given configuration
    fn generate(&mut self, config: &ImageGenConfig) -> Result<GeneratedImage>;

    /// Whether model weights currently occupy device memory
    fn is_resident(&self) -> bool {
        false
    }

    /// Bring weights onto the device ahead of the first `generate`
    fn preload(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop any device-resident weights; the next `generate` reloads them
    fn offload(&mut self) {}

    /// Wait for queued device work to finish, keeping the weights
    fn clear_transient(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(ImageGenConfig::new("a castle").validate().is_ok());
        assert!(ImageGenConfig::new("a castle").with_size(500, 512).validate().is_err());
        assert!(ImageGenConfig::new("a castle").with_steps(0).validate().is_err());
        assert!(ImageGenConfig::new("a castle").with_size(0, 0).validate().is_err());
    }

    #[test]
    fn test_png_encoding() {
        let image = GeneratedImage {
            data: vec![255; 2 * 2 * 3],
            width: 2,
            height: 2,
            prompt: "white".into(),
            seed: 1,
        };
        let png = image.to_png().unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn test_png_rejects_short_buffer() {
        let image = GeneratedImage {
            data: vec![0; 5],
            width: 2,
            height: 2,
            prompt: String::new(),
            seed: 0,
        };
        assert!(image.to_png().is_err());
    }
}
