// In-process diffusion through imagent
//
// Generation is CPU/GPU bound and synchronous, so every call runs on the
// blocking pool. The job carries the caller's device hold, so if the caller
// times out the accelerator stays locked until the run actually returns.

use super::{ImageParams, ImageProvider};
use crate::orchestration::arbiter::{DeviceHold, ResidentModel};
use crate::orchestration::error::ProviderError;
use async_trait::async_trait;
use imagent::{ImageGenConfig, ImageGenerator};
use std::sync::{Arc, Mutex};

pub struct LocalDiffusion<G> {
    generator: Arc<Mutex<G>>,
    max_steps: usize,
}

impl<G> Clone for LocalDiffusion<G> {
    fn clone(&self) -> Self {
        Self {
            generator: self.generator.clone(),
            max_steps: self.max_steps,
        }
    }
}

impl<G: ImageGenerator + Send + 'static> LocalDiffusion<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator: Arc::new(Mutex::new(generator)),
            max_steps: 50,
        }
    }

    /// Step budget; requests above it are clamped
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    async fn with_generator<T, F>(&self, f: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(&mut G) -> Result<T, ProviderError> + Send + 'static,
    {
        let generator = self.generator.clone();
        let hold = DeviceHold::current();
        tokio::task::spawn_blocking(move || {
            let _hold = hold;
            let mut generator = generator
                .lock()
                .map_err(|_| ProviderError::Local("diffusion runtime poisoned by an earlier panic".into()))?;
            f(&mut generator)
        })
        .await
        .map_err(|e| ProviderError::Local(format!("diffusion task failed: {}", e)))?
    }
}

#[async_trait]
impl<G: ImageGenerator + Send + 'static> ImageProvider for LocalDiffusion<G> {
    async fn image(&self, backing: &str, prompt: &str, params: &ImageParams) -> Result<Vec<u8>, ProviderError> {
        let steps = params.steps.min(self.max_steps);
        if steps < params.steps {
            tracing::debug!("Clamped {} steps to {} for {}", params.steps, steps, backing);
        }

        let mut config = ImageGenConfig::new(prompt)
            .with_size(params.width, params.height)
            .with_steps(steps);
        if let Some(negative) = &params.negative_prompt {
            config = config.with_negative_prompt(negative.clone());
        }
        config.seed = params.seed;

        self.with_generator(move |generator| {
            let image = generator.generate(&config)?;
            tracing::info!("Generated {}x{} image (seed {})", image.width, image.height, image.seed);
            Ok(image.to_png()?)
        })
        .await
    }
}

#[async_trait]
impl<G: ImageGenerator + Send + 'static> ResidentModel for LocalDiffusion<G> {
    async fn offload(&self) -> Result<(), ProviderError> {
        self.with_generator(|generator| {
            generator.offload();
            Ok(())
        })
        .await
    }

    async fn restore(&self) -> Result<(), ProviderError> {
        self.with_generator(|generator| Ok(generator.preload()?)).await
    }

    async fn clear_transient(&self) -> Result<(), ProviderError> {
        self.with_generator(|generator| Ok(generator.clear_transient()?)).await
    }
}
