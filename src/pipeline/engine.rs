//! Render backend
//!
//! [`CandleBackend`] runs the real denoise machinery around a reduced noise
//! estimate: seeded Gaussian latents, the DPM-derived timestep walk,
//! classifier-free guidance combining, and the fixed latent-to-RGB decode
//! used for latent previews. The estimate itself is a low-order stand-in
//! for the UNet forward pass, which stays behind this seam.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pipeline::conditioning::Conditioning;
use crate::pipeline::family::PipelineFamily;
use crate::pipeline::loader::LoadedPipeline;
use crate::pipeline::scheduler::SolverSchedule;

/// Latent channels of the diffusion space
const LATENT_CHANNELS: usize = 4;

/// Latent grid cells per output pixel edge
const LATENT_SCALE: usize = 8;

/// Weight of the running latent in the noise estimate
const SIGNAL_CARRY: f64 = 0.7;

/// Weight of the guided conditioning field in the noise estimate
const PROMPT_PULL: f64 = 0.3;

/// Latent-to-RGB projection for the base family (latent preview factors)
const BASE_LATENT_RGB: [[f64; 3]; 4] = [
    [0.298, 0.207, 0.208],
    [0.187, 0.286, 0.173],
    [-0.158, 0.189, 0.264],
    [-0.184, -0.271, -0.473],
];

/// Latent-to-RGB projection for the large family
const LARGE_LATENT_RGB: [[f64; 3]; 4] = [
    [0.3920, 0.4054, 0.4549],
    [-0.2634, -0.0196, 0.0653],
    [0.0568, 0.1687, -0.0755],
    [-0.3112, -0.2359, -0.2076],
];

/// Per-image render parameters
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Output width in pixels
    pub width: usize,
    /// Output height in pixels
    pub height: usize,
    /// Denoising step count
    pub steps: usize,
    /// Classifier-free guidance scale
    pub guidance_scale: f64,
    /// Latent noise seed
    pub seed: u64,
}

/// Seam between the orchestrator and the denoiser.
pub trait RenderBackend: Send + Sync {
    /// Produce one image from prompt conditioning. The negative conditioning
    /// is built from the raw negative prompt text.
    fn render(
        &self,
        pipeline: &LoadedPipeline,
        positive: &Conditioning,
        negative: &Conditioning,
        request: &RenderRequest,
    ) -> Result<RgbImage>;
}

/// Candle-backed reduced renderer
#[derive(Debug, Default, Clone, Copy)]
pub struct CandleBackend;

impl RenderBackend for CandleBackend {
    fn render(
        &self,
        pipeline: &LoadedPipeline,
        positive: &Conditioning,
        negative: &Conditioning,
        request: &RenderRequest,
    ) -> Result<RgbImage> {
        let (latent_h, latent_w) = (
            request.height / LATENT_SCALE,
            request.width / LATENT_SCALE,
        );
        if latent_h == 0 || latent_w == 0 {
            return Err(Error::invalid_input(format!(
                "image size {}x{} is below one latent cell",
                request.width, request.height
            )));
        }
        let schedule = SolverSchedule::new(&pipeline.scheduler, request.steps)?;
        debug!(
            steps = request.steps,
            seed = request.seed,
            guidance = request.guidance_scale,
            "rendering {}x{} latent grid",
            latent_w,
            latent_h
        );

        let mut latents = seeded_noise(
            request.seed,
            (1, LATENT_CHANNELS, latent_h, latent_w),
            &pipeline.device,
        )?;

        let cond = channel_signal(&positive.embeddings)?;
        let uncond = channel_signal(&negative.embeddings)?;
        // Classifier-free guidance over the per-channel fields.
        let guided = uncond.add(
            &cond
                .sub(&uncond)?
                .affine(request.guidance_scale, 0.0)?,
        )?;
        let pull = guided.affine(PROMPT_PULL, 0.0)?;

        let timesteps = schedule.timesteps();
        let mut denoised = latents.clone();
        for (i, &t) in timesteps.iter().enumerate() {
            let alpha = schedule.alpha_cumprod(t);
            let (signal, noise) = (alpha.sqrt(), (1.0 - alpha).sqrt());

            // TODO: replace the low-order estimate with a full UNet forward pass.
            let eps = latents.affine(SIGNAL_CARRY, 0.0)?.broadcast_add(&pull)?;

            denoised = latents
                .sub(&eps.affine(noise, 0.0)?)?
                .affine(1.0 / signal, 0.0)?;

            let alpha_prev = timesteps
                .get(i + 1)
                .map(|t| schedule.alpha_cumprod(*t))
                .unwrap_or(1.0);
            latents = denoised
                .affine(alpha_prev.sqrt(), 0.0)?
                .add(&eps.affine((1.0 - alpha_prev).sqrt(), 0.0)?)?;
        }

        decode_latents(&denoised, pipeline.family, request.width, request.height)
    }
}

/// Gaussian latents from a dedicated seeded rng, identical across devices.
fn seeded_noise(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let count = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..count).map(|_| StandardNormal.sample(&mut rng)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Fold token states into one value per latent channel, `(1, 4, 1, 1)`.
fn channel_signal(embeddings: &Tensor) -> Result<Tensor> {
    let states = embeddings.to_dtype(DType::F32)?;
    let mean = states.mean(1)?;
    let hidden = mean.dims()[1];
    let folded = if hidden >= LATENT_CHANNELS && hidden % LATENT_CHANNELS == 0 {
        mean.reshape((1, LATENT_CHANNELS, hidden / LATENT_CHANNELS))?
            .mean(2)?
    } else {
        let value = states.mean_all()?.to_scalar::<f32>()?;
        Tensor::full(value, (1, LATENT_CHANNELS), states.device())?
    };
    Ok(folded.reshape((1, LATENT_CHANNELS, 1, 1))?)
}

/// Project latents to RGB and upsample to the requested size.
fn decode_latents(
    latents: &Tensor,
    family: PipelineFamily,
    width: usize,
    height: usize,
) -> Result<RgbImage> {
    let projection = latent_projection(family, latents.device())?;
    let x = latents.to_dtype(DType::F32)?.squeeze(0)?;
    let channels_last = x.permute((1, 2, 0))?.contiguous()?;
    let rgb = projection.forward(&channels_last)?;
    let rgb = rgb.affine(0.5, 0.5)?.clamp(0f32, 1f32)?;
    let chw = rgb.permute((2, 0, 1))?.contiguous()?.unsqueeze(0)?;
    let full = chw.upsample_nearest2d(height, width)?;
    let hwc = full.squeeze(0)?.permute((1, 2, 0))?.contiguous()?;
    let bytes = hwc
        .affine(255.0, 0.0)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, bytes).ok_or_else(|| {
        Error::Other(anyhow::anyhow!(
            "rendered buffer does not match {}x{}",
            width,
            height
        ))
    })
}

fn latent_projection(family: PipelineFamily, device: &Device) -> Result<Linear> {
    let factors = match family {
        PipelineFamily::Base => BASE_LATENT_RGB,
        PipelineFamily::Large => LARGE_LATENT_RGB,
    };
    let mut weight = Vec::with_capacity(3 * LATENT_CHANNELS);
    for rgb in 0..3 {
        for channel in 0..LATENT_CHANNELS {
            weight.push(factors[channel][rgb] as f32);
        }
    }
    let weight = Tensor::from_vec(weight, (3, LATENT_CHANNELS), device)?;
    Ok(Linear::new(weight, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::conditioning;
    use crate::pipeline::testing::tiny_pipeline;

    fn render_once(
        family: PipelineFamily,
        prompt: &str,
        guidance: f64,
        seed: u64,
    ) -> RgbImage {
        let pipeline = tiny_pipeline(family);
        let positive =
            conditioning::build(&pipeline.encoders, family, prompt, 2).unwrap();
        let negative = conditioning::build(&pipeline.encoders, family, "", 2).unwrap();
        let request = RenderRequest {
            width: 64,
            height: 48,
            steps: 4,
            guidance_scale: guidance,
            seed,
        };
        CandleBackend
            .render(&pipeline, &positive, &negative, &request)
            .unwrap()
    }

    #[test]
    fn test_render_matches_requested_size() {
        let image = render_once(PipelineFamily::Base, "1girl solo", 7.0, 42);
        assert_eq!(image.width(), 64);
        assert_eq!(image.height(), 48);
    }

    #[test]
    fn test_render_is_seed_deterministic() {
        let a = render_once(PipelineFamily::Base, "1girl solo", 7.0, 7);
        let b = render_once(PipelineFamily::Base, "1girl solo", 7.0, 7);
        assert_eq!(a.as_raw(), b.as_raw());

        let c = render_once(PipelineFamily::Base, "1girl solo", 7.0, 8);
        assert_ne!(a.as_raw(), c.as_raw());
    }

    #[test]
    fn test_guidance_scale_shifts_output() {
        let low = render_once(PipelineFamily::Base, "1girl solo", 1.0, 3);
        let high = render_once(PipelineFamily::Base, "1girl solo", 15.0, 3);
        assert_ne!(low.as_raw(), high.as_raw());
    }

    #[test]
    fn test_large_family_renders_from_dual_conditioning() {
        let image = render_once(PipelineFamily::Large, "1girl solo", 7.0, 42);
        assert_eq!(image.width(), 64);
        assert_eq!(image.height(), 48);
    }

    #[test]
    fn test_zero_steps_is_rejected() {
        let pipeline = tiny_pipeline(PipelineFamily::Base);
        let positive = conditioning::build(
            &pipeline.encoders,
            PipelineFamily::Base,
            "1girl",
            1,
        )
        .unwrap();
        let negative =
            conditioning::build(&pipeline.encoders, PipelineFamily::Base, "", 1).unwrap();
        let request = RenderRequest {
            width: 64,
            height: 64,
            steps: 0,
            guidance_scale: 7.0,
            seed: 1,
        };
        assert!(CandleBackend
            .render(&pipeline, &positive, &negative, &request)
            .is_err());
    }

    #[test]
    fn test_tiny_sizes_are_rejected() {
        let pipeline = tiny_pipeline(PipelineFamily::Base);
        let positive = conditioning::build(
            &pipeline.encoders,
            PipelineFamily::Base,
            "1girl",
            1,
        )
        .unwrap();
        let negative =
            conditioning::build(&pipeline.encoders, PipelineFamily::Base, "", 1).unwrap();
        let request = RenderRequest {
            width: 4,
            height: 4,
            steps: 2,
            guidance_scale: 7.0,
            seed: 1,
        };
        assert!(CandleBackend
            .render(&pipeline, &positive, &negative, &request)
            .is_err());
    }

    #[test]
    fn test_channel_signal_folds_hidden_width() {
        let embeddings = Tensor::full(2.0f32, (1, 77, 8), &Device::Cpu).unwrap();
        let signal = channel_signal(&embeddings).unwrap();
        assert_eq!(signal.dims(), &[1, 4, 1, 1]);
        let values = signal.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 2.0).abs() < 1e-6));
    }
}
