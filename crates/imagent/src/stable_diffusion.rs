// Stable Diffusion implementation using Candle

use crate::{GeneratedImage, ImageGenConfig, ImageGenError, ImageGenerator, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use tokenizers::Tokenizer;

/// Stable Diffusion model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    /// Stable Diffusion v1.5
    V1_5,
    /// Stable Diffusion v2.1
    V2_1,
}

impl StableDiffusionVersion {
    pub fn repo(&self) -> &str {
        match self {
            Self::V1_5 => "runwayml/stable-diffusion-v1-5",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
        }
    }

    pub fn default_steps(&self) -> usize {
        10
    }

    pub fn default_guidance(&self) -> f64 {
        7.5
    }

    fn tokenizer_repo(&self) -> &str {
        "openai/clip-vit-base-patch32"
    }
}

impl std::str::FromStr for StableDiffusionVersion {
    type Err = ImageGenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v1.5" | "v1_5" | "1.5" => Ok(Self::V1_5),
            "v2.1" | "v2_1" | "2.1" => Ok(Self::V2_1),
            other => Err(ImageGenError::InvalidConfig(format!(
                "Unsupported Stable Diffusion version '{}' (expected v1.5 or v2.1)",
                other
            ))),
        }
    }
}

/// Weights kept on the device between generations
struct Pipeline {
    tokenizer: Tokenizer,
    pad_id: u32,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

/// Stable Diffusion image generator
pub struct StableDiffusionGenerator {
    version: StableDiffusionVersion,
    device: Device,
    dtype: DType,
    guidance_scale: f64,
    vae_scale: f64,
    sd_config: StableDiffusionConfig,
    pipeline: Option<Pipeline>,
}

impl StableDiffusionGenerator {
    /// Create a new Stable Diffusion generator. Weights are fetched lazily.
    pub fn new(version: StableDiffusionVersion, use_cpu: bool) -> Result<Self> {
        let device = if use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)?
        };

        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };

        let sd_config = match version {
            StableDiffusionVersion::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            StableDiffusionVersion::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        };

        Ok(Self {
            version,
            device,
            dtype,
            guidance_scale: version.default_guidance(),
            vae_scale: 0.18215,
            sd_config,
            pipeline: None,
        })
    }

    /// Set guidance scale (classifier-free guidance)
    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }

    pub fn version(&self) -> StableDiffusionVersion {
        self.version
    }

    fn download_file(&self, filename: &str) -> Result<std::path::PathBuf> {
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| ImageGenError::HfHub(e.to_string()))?;

        api.model(self.version.repo().to_string())
            .get(filename)
            .map_err(|e| ImageGenError::HfHub(format!("Failed to download {}: {}", filename, e)))
    }

    /// Prefer fp16 weights on half-precision devices, fall back to fp32
    fn download_weights(&self, stem: &str) -> Result<std::path::PathBuf> {
        if self.dtype == DType::F16 {
            match self.download_file(&format!("{}.fp16.safetensors", stem)) {
                Ok(path) => return Ok(path),
                Err(_) => tracing::warn!("fp16 weights for {} not found, falling back to fp32", stem),
            }
        }
        self.download_file(&format!("{}.safetensors", stem))
    }

    /// Load tokenizer, text encoder, VAE and UNet onto the device
    pub fn load(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }

        tracing::info!("Loading Stable Diffusion {:?} onto {:?}", self.version, self.device);

        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| ImageGenError::HfHub(format!("Failed to create API: {}", e)))?;
        let tokenizer_path = api
            .model(self.version.tokenizer_repo().to_string())
            .get("tokenizer.json")
            .map_err(|e| ImageGenError::HfHub(format!("Failed to download tokenizer.json: {}", e)))?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| ImageGenError::Tokenization(e.to_string()))?;

        let pad_token = self
            .sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .ok_or_else(|| ImageGenError::Tokenization(format!("Pad token {} not found", pad_token)))?;

        let clip_weights = self.download_weights("text_encoder/model")?;
        let text_model = stable_diffusion::build_clip_transformer(
            &self.sd_config.clip,
            clip_weights,
            &self.device,
            self.dtype,
        )?;

        let vae_weights = self.download_weights("vae/diffusion_pytorch_model")?;
        let vae = self.sd_config.build_vae(vae_weights, &self.device, self.dtype)?;

        let unet_weights = self.download_weights("unet/diffusion_pytorch_model")?;
        let unet = self.sd_config.build_unet(
            unet_weights,
            &self.device,
            4, // standard latent channels
            false, // no flash attention
            self.dtype,
        )?;

        self.pipeline = Some(Pipeline {
            tokenizer,
            pad_id,
            text_model,
            vae,
            unet,
        });
        tracing::info!("Stable Diffusion {:?} resident", self.version);
        Ok(())
    }

    fn text_embeddings(&self, pipeline: &Pipeline, prompt: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;

        let mut tokens = pipeline
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ImageGenError::Tokenization(e.to_string()))?
            .get_ids()
            .to_vec();

        // CLIP has a fixed context; longer prompts are cut, shorter ones padded
        tokens.truncate(max_len);
        tokens.resize(max_len, pipeline.pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(pipeline.text_model.forward(&tokens)?)
    }
}

impl ImageGenerator for StableDiffusionGenerator {
    fn generate(&mut self, config: &ImageGenConfig) -> Result<GeneratedImage> {
        config.validate()?;
        self.load()?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| ImageGenError::InvalidConfig("Pipeline failed to load".into()))?;

        tracing::info!("Generating image with Stable Diffusion {:?}", self.version);
        tracing::debug!("Prompt: {}", config.prompt);

        let seed = config.seed.unwrap_or_else(rand::random);
        if let Err(e) = self.device.set_seed(seed) {
            tracing::debug!("Device does not accept a seed ({}), output is not reproducible", e);
        }

        // 1. Encode prompt, and the negative prompt as the unconditional branch
        let text_embeddings = self.text_embeddings(pipeline, &config.prompt)?;
        let text_embeddings = if self.guidance_scale > 1.0 {
            let uncond_embeddings = self.text_embeddings(pipeline, &config.negative_prompt)?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        };

        // 2. Initialize latents
        let latent_height = config.height / 8;
        let latent_width = config.width / 8;
        let mut latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, latent_height, latent_width),
            &self.device,
        )?
        .to_dtype(self.dtype)?;

        // 3. Diffusion loop
        let mut scheduler = self.sd_config.build_scheduler(config.num_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        tracing::info!("Running diffusion for {} steps", timesteps.len());
        for (step_idx, &timestep) in timesteps.iter().enumerate() {
            tracing::debug!("Step {}/{}", step_idx + 1, timesteps.len());

            let latent_model_input = if self.guidance_scale > 1.0 {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;

            let noise_pred =
                pipeline
                    .unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if self.guidance_scale > 1.0 {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * self.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        // 4. Decode latents to RGB bytes
        let image = pipeline.vae.decode(&(&latents / self.vae_scale)?)?;
        let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;

        let (_, _, height, width) = image.dims4()?;
        let data = image.i(0)?.permute((1, 2, 0))?.to_vec3::<u8>()?;
        let data: Vec<u8> = data.into_iter().flatten().flatten().collect();

        tracing::info!("Image generation complete (seed {})", seed);

        Ok(GeneratedImage {
            data,
            width: width as u32,
            height: height as u32,
            prompt: config.prompt.clone(),
            seed,
        })
    }

    fn is_resident(&self) -> bool {
        self.pipeline.is_some()
    }

    fn preload(&mut self) -> Result<()> {
        self.load()
    }

    fn offload(&mut self) {
        if self.pipeline.take().is_some() {
            tracing::info!("Released Stable Diffusion {:?} weights", self.version);
        }
    }

    fn clear_transient(&mut self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!("v1.5".parse::<StableDiffusionVersion>().unwrap(), StableDiffusionVersion::V1_5);
        assert_eq!("2.1".parse::<StableDiffusionVersion>().unwrap(), StableDiffusionVersion::V2_1);
        assert!("xl".parse::<StableDiffusionVersion>().is_err());
    }

    #[test]
    fn test_generator_starts_offloaded() {
        let mut generator = StableDiffusionGenerator::new(StableDiffusionVersion::V1_5, true).unwrap();
        assert!(!generator.is_resident());
        generator.offload();
        assert!(!generator.is_resident());
        assert!(generator.clear_transient().is_ok());
    }
}
