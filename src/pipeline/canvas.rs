//! Canvas compositor: drives the reverse-diffusion loop over a mixture of
//! text-driven and image-driven regions.

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, s, Array4, Axis, Ix4, SliceInfo, SliceInfoElem, Zip};
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::mask::MaskWeightsBuilder;
use crate::model::{
    ClipTokenizer, Denoiser, ImageDecoder, ImageEncoder, LatentTensor, ModelCache, OnnxDenoiser,
    OnnxImageDecoder, OnnxImageEncoder, OnnxTextEncoder, TextEncoder, TokenizedPrompt, Tokenizer,
};
use crate::region::{
    CanvasRegion, DiffusionRegion, Image2ImageRegion, Text2ImageRegion, LATENT_SCALE,
};
use crate::scheduler::Scheduler;

/// Configuration for one generation request.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    /// Canvas height in pixels.
    pub canvas_height: usize,

    /// Canvas width in pixels.
    pub canvas_width: usize,

    /// Number of reverse-diffusion steps.
    pub num_steps: usize,

    /// DDIM eta parameter, forwarded to the scheduler on every step.
    pub eta: f32,

    /// Random seed for the initial canvas noise. None for random.
    pub seed: Option<u64>,

    /// Per-region seed overrides: each rectangle's initial noise is
    /// redrawn from an independent generator seeded with the given value.
    pub reroll_regions: Vec<(CanvasRegion, u64)>,

    /// Route decoding through a CPU-resident decoder to conserve
    /// accelerator memory.
    pub cpu_decode: bool,

    /// Capture a decoded snapshot of the canvas after every step.
    pub decode_steps: bool,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            canvas_height: 512,
            canvas_width: 512,
            num_steps: 50,
            eta: 0.0,
            seed: None,
            reroll_regions: Vec::new(),
            cpu_decode: false,
            decode_steps: false,
        }
    }
}

impl GenerateConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.canvas_height < LATENT_SCALE || self.canvas_width < LATENT_SCALE {
            return Err(Error::InvalidParameter {
                name: "canvas dimensions".to_string(),
                reason: format!(
                    "must be at least {LATENT_SCALE}x{LATENT_SCALE} pixels, got {}x{}",
                    self.canvas_width, self.canvas_height
                ),
            });
        }

        if self.num_steps == 0 {
            return Err(Error::InvalidParameter {
                name: "num_steps".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.eta) {
            return Err(Error::InvalidParameter {
                name: "eta".to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }

        Ok(())
    }
}

/// Result of a generation request.
pub struct GenerationOutput {
    /// Final decoded image, NCHW in [-1, 1].
    pub image: ImageTensor,

    /// Decoded snapshot after each step, if requested. One entry per
    /// timestep, in schedule order.
    pub step_images: Vec<ImageTensor>,
}

/// Pipeline that mixes several diffusion regions in the same canvas.
///
/// Every model component is an external collaborator behind a trait: the
/// pipeline owns the orchestration only. The scheduler is caller-supplied;
/// the frozen model traits can be wired to the ONNX-backed
/// implementations via [`with_onnx_models`](Self::with_onnx_models).
pub struct CanvasPipeline {
    tokenizer: Box<dyn Tokenizer>,
    text_encoder: Box<dyn TextEncoder>,
    image_encoder: Box<dyn ImageEncoder>,
    image_decoder: Box<dyn ImageDecoder>,
    denoiser: Box<dyn Denoiser>,
    scheduler: Box<dyn Scheduler>,
}

impl CanvasPipeline {
    /// Assemble a pipeline from its collaborators.
    #[must_use]
    pub fn new(
        tokenizer: Box<dyn Tokenizer>,
        text_encoder: Box<dyn TextEncoder>,
        image_encoder: Box<dyn ImageEncoder>,
        image_decoder: Box<dyn ImageDecoder>,
        denoiser: Box<dyn Denoiser>,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        Self {
            tokenizer,
            text_encoder,
            image_encoder,
            image_decoder,
            denoiser,
            scheduler,
        }
    }

    /// Assemble a pipeline around the Stable Diffusion 1.5 ONNX exports,
    /// downloading them into the model cache if necessary. The scheduler
    /// stays caller-supplied.
    ///
    /// # Errors
    ///
    /// Returns an error if any model cannot be downloaded or loaded.
    pub fn with_onnx_models(scheduler: Box<dyn Scheduler>) -> Result<Self> {
        tracing::info!("Initializing canvas pipeline from ONNX models");

        let cache = ModelCache::new()?;

        tracing::info!("Loading tokenizer...");
        let tokenizer = ClipTokenizer::from_cache(&cache)?;

        tracing::info!("Loading text encoder...");
        let text_encoder = OnnxTextEncoder::from_cache(&cache)?;

        tracing::info!("Loading VAE encoder...");
        let image_encoder = OnnxImageEncoder::from_cache(&cache)?;

        tracing::info!("Loading VAE decoder...");
        let image_decoder = OnnxImageDecoder::from_cache(&cache)?;

        tracing::info!("Loading UNet...");
        let denoiser = OnnxDenoiser::from_cache(&cache)?;

        tracing::info!("Pipeline initialized successfully");

        Ok(Self::new(
            Box::new(tokenizer),
            Box::new(text_encoder),
            Box::new(image_encoder),
            Box::new(image_decoder),
            Box::new(denoiser),
            scheduler,
        ))
    }

    /// Run one generation request, compositing all regions into a single
    /// canvas across the reverse-diffusion schedule.
    ///
    /// Regions are consumed: their conditioning is prepared in place
    /// before the loop and held read-only through it.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration or region geometry, and
    /// propagates collaborator failures uncaught. Any failure aborts the
    /// whole generation; there is no partial-result recovery.
    #[allow(clippy::too_many_lines)]
    pub fn generate(
        &mut self,
        regions: Vec<DiffusionRegion>,
        config: &GenerateConfig,
    ) -> Result<GenerationOutput> {
        config.validate()?;

        let batch_size = 1;
        let channels = self.denoiser.latent_channels();
        let latent_height = config.canvas_height / LATENT_SCALE;
        let latent_width = config.canvas_width / LATENT_SCALE;
        let latents_shape = (batch_size, channels, latent_height, latent_width);

        for region in &regions {
            validate_region_fits(region.canvas(), latent_height, latent_width)?;
        }
        for (region, _) in &config.reroll_regions {
            validate_region_fits(region, latent_height, latent_width)?;
        }

        // Create original noisy latents
        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        tracing::info!(
            "Seeding {}x{} latent canvas (seed {seed})",
            latent_width,
            latent_height
        );
        let (init_noise, mut latents) =
            seed_canvas(latents_shape, seed, &config.reroll_regions);

        // Prepare scheduler
        let offset = usize::from(self.scheduler.accepts_offset());
        self.scheduler.set_timesteps(config.num_steps, offset);
        // Sigma-scaled schedulers expect latents premultiplied by the
        // initial noise level
        if let Some(sigmas) = self.scheduler.sigmas() {
            latents *= sigmas[0];
        }

        // Split diffusion regions by their kind
        let mut text_regions: Vec<Text2ImageRegion> = Vec::new();
        let mut image_regions: Vec<Image2ImageRegion> = Vec::new();
        for region in regions {
            match region {
                DiffusionRegion::Text2Image(region) => text_regions.push(region),
                DiffusionRegion::Image2Image(region) => image_regions.push(region),
            }
        }

        // Prepare text embeddings, paired with an unconditional embedding
        // for classifier free guidance. The pair is concatenated into a
        // single batch so each region costs one denoiser pass per step.
        tracing::info!("Encoding prompts for {} text regions", text_regions.len());
        for region in &mut text_regions {
            region.tokenize_prompt(&*self.tokenizer)?;
            region.encode_prompt(&mut *self.text_encoder)?;

            let max_length = region
                .tokenized_prompt()
                .map(TokenizedPrompt::len)
                .ok_or(Error::PromptNotTokenized)?;
            let uncond_tokens = self.tokenizer.tokenize("", max_length)?;
            let uncond_embedding = self.text_encoder.encode(&uncond_tokens)?;
            region.prepend_unconditional(uncond_embedding)?;
        }

        // Prepare image latents
        tracing::info!(
            "Encoding references for {} image regions",
            image_regions.len()
        );
        for region in &mut image_regions {
            region.encode_reference_image(&mut *self.image_encoder)?;
        }

        // Prepare mask of weights for each text region
        let mask_builder = MaskWeightsBuilder::new(channels, batch_size);
        let mask_weights: Vec<Array4<f32>> = text_regions
            .iter()
            .map(|region| {
                mask_builder.compute(region.canvas(), region.mask_mode(), region.mask_weight())
            })
            .collect();

        let timesteps = self.scheduler.timesteps().to_vec();
        let sigmas = self.scheduler.sigmas().map(<[f32]>::to_vec);

        let pb = ProgressBar::new(timesteps.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} Compositing [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("valid template")
                .progress_chars("#>-"),
        );

        let mut step_images = Vec::new();

        // Diffusion timesteps
        for (i, &t) in timesteps.iter().enumerate() {
            // Image2Image regions: while within a region's strength-derived
            // window, overwrite its canvas slice with the forward-noised
            // reference; past the cutoff the canvas evolves freely.
            for region in &image_regions {
                if i < influence_steps(region.strength(), config.num_steps, offset) {
                    let region_init_noise =
                        init_noise.slice(region_slice(region.canvas())).to_owned();
                    let region_latents =
                        self.scheduler
                            .add_noise(region.reference_latents()?, &region_init_noise, t)?;
                    latents
                        .slice_mut(region_slice(region.canvas()))
                        .assign(&region_latents);
                }
            }

            // Text2Image regions: one guided denoiser pass per region
            let mut noise_preds_regions = Vec::with_capacity(text_regions.len());
            for region in &text_regions {
                let region_latents = latents.slice(region_slice(region.canvas())).to_owned();
                // Expand the latents for classifier free guidance
                let mut latent_model_input =
                    concatenate(Axis(0), &[region_latents.view(), region_latents.view()])
                        .expect("duplicating along the batch axis preserves shape");
                if let Some(sigmas) = &sigmas {
                    // Scale the input to match the continuous ODE formulation
                    let sigma = sigmas[i];
                    latent_model_input /= (sigma * sigma + 1.0).sqrt();
                }

                let encoded_prompt = region.encoded_prompt().ok_or(Error::PromptNotEncoded)?;
                let noise_pred =
                    self.denoiser
                        .predict_noise(&latent_model_input, t, encoded_prompt)?;

                // Perform guidance
                let noise_pred_uncond = noise_pred.slice(s![0..1, .., .., ..]);
                let noise_pred_text = noise_pred.slice(s![1..2, .., .., ..]);
                let guided = (&noise_pred_text - &noise_pred_uncond) * region.guidance_scale()
                    + &noise_pred_uncond;
                noise_preds_regions.push(guided);
            }

            // Merge noise predictions for all regions
            let noise_pred = blend_noise_predictions(
                latents_shape,
                &text_regions,
                &noise_preds_regions,
                &mask_weights,
            );

            // Compute the previous noisy sample x_t -> x_t-1
            latents = self
                .scheduler
                .step(&noise_pred, i, t, &latents, config.eta)?;

            if config.decode_steps {
                step_images.push(self.image_decoder.decode(&latents, config.cpu_decode)?);
            }

            pb.inc(1);
        }

        pb.finish_with_message("Compositing complete");

        tracing::info!("Decoding final latents");
        let image = self.image_decoder.decode(&latents, config.cpu_decode)?;

        Ok(GenerationOutput { image, step_images })
    }
}

/// Draw the canvas-wide initial noise and apply per-region reroll
/// overrides.
///
/// Returns `(init_noise, latents)`: `init_noise` is the untouched
/// canvas-wide draw, retained for reference-noise injection; `latents` is
/// the working copy with each reroll rectangle overwritten by an
/// independently seeded draw.
fn seed_canvas(
    shape: (usize, usize, usize, usize),
    seed: u64,
    reroll_regions: &[(CanvasRegion, u64)],
) -> (LatentTensor, LatentTensor) {
    let init_noise = draw_latent_noise(shape, seed);
    let mut latents = init_noise.clone();

    for (region, reroll_seed) in reroll_regions {
        let region_shape = (
            shape.0,
            shape.1,
            region.latent_height(),
            region.latent_width(),
        );
        let reroll = draw_latent_noise(region_shape, *reroll_seed);
        latents.slice_mut(region_slice(region)).assign(&reroll);
    }

    (init_noise, latents)
}

/// Draw standard-normal latent noise from a generator seeded with `seed`.
fn draw_latent_noise(shape: (usize, usize, usize, usize), seed: u64) -> LatentTensor {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    Array4::from_shape_simple_fn(shape, || rng.sample(StandardNormal))
}

/// Accumulate each region's guided prediction, scaled by its mask weights,
/// then normalize by the per-position total weight. Positions covered by
/// no region blend to exactly zero rather than dividing by zero.
fn blend_noise_predictions(
    shape: (usize, usize, usize, usize),
    regions: &[Text2ImageRegion],
    predictions: &[LatentTensor],
    mask_weights: &[Array4<f32>],
) -> LatentTensor {
    let mut noise_pred = Array4::<f32>::zeros(shape);
    let mut contributors = Array4::<f32>::zeros(shape);

    for ((region, prediction), weights) in regions.iter().zip(predictions).zip(mask_weights) {
        let weighted = prediction * weights;
        let mut pred_slice = noise_pred.slice_mut(region_slice(region.canvas()));
        pred_slice += &weighted;
        let mut contrib_slice = contributors.slice_mut(region_slice(region.canvas()));
        contrib_slice += weights;
    }

    // Average overlapping areas with more than one contributor
    Zip::from(&mut noise_pred)
        .and(&contributors)
        .for_each(|pred, &total| {
            if total == 0.0 {
                *pred = 0.0;
            } else {
                *pred /= total;
            }
        });

    noise_pred
}

/// Index of the first step at which a region's reference stops being
/// re-injected, clamped to the schedule length.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn influence_steps(strength: f32, num_steps: usize, offset: usize) -> usize {
    let influence = (num_steps as f32 * strength) as usize + offset;
    influence.min(num_steps)
}

/// NCHW slice covering a region's latent rectangle.
fn region_slice(region: &CanvasRegion) -> SliceInfo<[SliceInfoElem; 4], Ix4, Ix4> {
    s![
        ..,
        ..,
        region.latent_row_init()..region.latent_row_end(),
        region.latent_col_init()..region.latent_col_end()
    ]
}

/// Reject regions whose latent rectangle falls outside the canvas.
fn validate_region_fits(
    region: &CanvasRegion,
    latent_height: usize,
    latent_width: usize,
) -> Result<()> {
    if region.latent_row_end() > latent_height || region.latent_col_end() > latent_width {
        return Err(Error::InvalidRegion {
            reason: format!(
                "region latent bounds ({}, {}) exceed canvas latent shape ({latent_height}, {latent_width})",
                region.latent_row_end(),
                region.latent_col_end()
            ),
        });
    }
    Ok(())
}
