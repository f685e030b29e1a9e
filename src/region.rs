//! Canvas regions and their per-region diffusion configuration.

use image::DynamicImage;
use ndarray::concatenate;
use ndarray::Axis;

use crate::error::{Error, Result};
use crate::image::{image_to_tensor, ImageTensor};
use crate::model::{
    ImageEncoder, LatentTensor, PromptEmbedding, TextEncoder, TokenizedPrompt, Tokenizer,
};

/// Fixed downscale ratio between pixel space and latent space.
pub const LATENT_SCALE: usize = 8;

/// Modes in which the influence of a diffusion region is masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMode {
    /// Uniform weight over the whole region.
    Constant,
    /// Separable 2-D Gaussian, strongest at the region center.
    Gaussian,
    /// Separable quartic (biweight) kernel with bounded support.
    /// See <https://en.wikipedia.org/wiki/Kernel_(statistics)>
    Quartic,
}

/// A rectangular region in the canvas, in pixel coordinates.
///
/// Bounds are half-open: `row_init` is included, `row_end` is not. Latent
/// coordinates are derived once at construction by floor division by
/// [`LATENT_SCALE`], so region edges not aligned to 8 pixels may map to
/// non-uniformly sized latent rectangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasRegion {
    row_init: usize,
    row_end: usize,
    col_init: usize,
    col_end: usize,
}

impl CanvasRegion {
    /// Create a region, validating that the rectangle is non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRegion`] for empty or inverted rectangles.
    pub fn new(row_init: usize, row_end: usize, col_init: usize, col_end: usize) -> Result<Self> {
        if row_end <= row_init {
            return Err(Error::InvalidRegion {
                reason: format!("row_end ({row_end}) must be greater than row_init ({row_init})"),
            });
        }
        if col_end <= col_init {
            return Err(Error::InvalidRegion {
                reason: format!("col_end ({col_end}) must be greater than col_init ({col_init})"),
            });
        }

        Ok(Self {
            row_init,
            row_end,
            col_init,
            col_end,
        })
    }

    /// Region width in pixels.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.col_end - self.col_init
    }

    /// Region height in pixels.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.row_end - self.row_init
    }

    /// Starting row in pixel space (included).
    #[must_use]
    pub const fn row_init(&self) -> usize {
        self.row_init
    }

    /// End row in pixel space (not included).
    #[must_use]
    pub const fn row_end(&self) -> usize {
        self.row_end
    }

    /// Starting column in pixel space (included).
    #[must_use]
    pub const fn col_init(&self) -> usize {
        self.col_init
    }

    /// End column in pixel space (not included).
    #[must_use]
    pub const fn col_end(&self) -> usize {
        self.col_end
    }

    /// Starting row in latent space (included).
    #[must_use]
    pub const fn latent_row_init(&self) -> usize {
        self.row_init / LATENT_SCALE
    }

    /// End row in latent space (not included).
    #[must_use]
    pub const fn latent_row_end(&self) -> usize {
        self.row_end / LATENT_SCALE
    }

    /// Starting column in latent space (included).
    #[must_use]
    pub const fn latent_col_init(&self) -> usize {
        self.col_init / LATENT_SCALE
    }

    /// End column in latent space (not included).
    #[must_use]
    pub const fn latent_col_end(&self) -> usize {
        self.col_end / LATENT_SCALE
    }

    /// Region height in latent space.
    #[must_use]
    pub const fn latent_height(&self) -> usize {
        self.latent_row_end() - self.latent_row_init()
    }

    /// Region width in latent space.
    #[must_use]
    pub const fn latent_width(&self) -> usize {
        self.latent_col_end() - self.latent_col_init()
    }
}

/// Conditioning state of a text region's prompt.
///
/// Preparation is two-phase: a prompt must be tokenized before it can be
/// encoded. Out-of-order calls are rejected with a typed error rather than
/// a panic.
#[derive(Debug, Clone, Default)]
pub enum PromptConditioning {
    /// No preparation has happened yet.
    #[default]
    Unprepared,
    /// The prompt has been tokenized but not encoded.
    Tokenized(TokenizedPrompt),
    /// The prompt has been encoded; after guidance pairing this holds the
    /// batch-concatenated `[unconditional; conditional]` embedding pair.
    Encoded(PromptEmbedding),
}

/// A region where a text-guided diffusion process is acting.
#[derive(Debug, Clone)]
pub struct Text2ImageRegion {
    canvas: CanvasRegion,
    mask_mode: MaskMode,
    mask_weight: f32,
    prompt: String,
    guidance_scale: f32,
    downscaling_factor: usize,
    tokenized: Option<TokenizedPrompt>,
    conditioning: PromptConditioning,
}

impl Text2ImageRegion {
    /// Default classifier-free-guidance strength.
    pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;

    /// Create a text-guided region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `mask_weight` is not positive.
    pub fn new(
        canvas: CanvasRegion,
        mask_mode: MaskMode,
        mask_weight: f32,
        prompt: impl Into<String>,
        guidance_scale: f32,
    ) -> Result<Self> {
        validate_mask_weight(mask_weight)?;

        Ok(Self {
            canvas,
            mask_mode,
            mask_weight,
            prompt: prompt.into(),
            guidance_scale,
            downscaling_factor: 1,
            tokenized: None,
            conditioning: PromptConditioning::Unprepared,
        })
    }

    /// The pixel rectangle this region covers.
    #[must_use]
    pub const fn canvas(&self) -> &CanvasRegion {
        &self.canvas
    }

    /// Mask shape used when blending this region with its neighbours.
    #[must_use]
    pub const fn mask_mode(&self) -> MaskMode {
        self.mask_mode
    }

    /// Mask strength multiplier.
    #[must_use]
    pub const fn mask_weight(&self) -> f32 {
        self.mask_weight
    }

    /// Text prompt guiding the diffuser in this region.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Classifier-free-guidance strength for this region.
    #[must_use]
    pub const fn guidance_scale(&self) -> f32 {
        self.guidance_scale
    }

    /// Latent dilation hint. Carried for configuration compatibility; the
    /// compositor does not currently consume it.
    #[must_use]
    pub const fn downscaling_factor(&self) -> usize {
        self.downscaling_factor
    }

    /// Override the latent dilation hint.
    pub fn set_downscaling_factor(&mut self, factor: usize) {
        self.downscaling_factor = factor;
    }

    /// Tokenize the prompt for this region using the given tokenizer,
    /// padding to the tokenizer's model maximum length with truncation.
    ///
    /// # Errors
    ///
    /// Propagates tokenizer failures.
    pub fn tokenize_prompt(&mut self, tokenizer: &dyn Tokenizer) -> Result<()> {
        let tokens = tokenizer.tokenize(&self.prompt, tokenizer.model_max_length())?;
        self.tokenized = Some(tokens.clone());
        self.conditioning = PromptConditioning::Tokenized(tokens);
        Ok(())
    }

    /// Encode the previously tokenized prompt using the given text encoder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PromptNotTokenized`] if called before
    /// [`tokenize_prompt`](Self::tokenize_prompt).
    pub fn encode_prompt(&mut self, text_encoder: &mut dyn TextEncoder) -> Result<()> {
        let tokens = match &self.conditioning {
            PromptConditioning::Tokenized(tokens) => tokens.clone(),
            PromptConditioning::Unprepared | PromptConditioning::Encoded(_) => {
                return Err(Error::PromptNotTokenized)
            }
        };
        let embedding = text_encoder.encode(&tokens)?;
        self.conditioning = PromptConditioning::Encoded(embedding);
        Ok(())
    }

    /// Concatenate an unconditional embedding in front of the encoded
    /// prompt along the batch axis, producing the paired input required
    /// for classifier-free guidance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PromptNotEncoded`] if the prompt has not been
    /// encoded yet.
    pub fn prepend_unconditional(&mut self, unconditional: PromptEmbedding) -> Result<()> {
        let encoded = match &self.conditioning {
            PromptConditioning::Encoded(embedding) => embedding,
            PromptConditioning::Unprepared | PromptConditioning::Tokenized(_) => {
                return Err(Error::PromptNotEncoded)
            }
        };
        let paired = concatenate(Axis(0), &[unconditional.view(), encoded.view()]).map_err(
            |_| Error::ShapeMismatch {
                expected: format!("{:?}", encoded.shape()),
                actual: format!("{:?}", unconditional.shape()),
            },
        )?;
        self.conditioning = PromptConditioning::Encoded(paired);
        Ok(())
    }

    /// The tokenized prompt, if tokenization has happened.
    #[must_use]
    pub const fn tokenized_prompt(&self) -> Option<&TokenizedPrompt> {
        self.tokenized.as_ref()
    }

    /// The encoded prompt embedding, if encoding has happened.
    #[must_use]
    pub const fn encoded_prompt(&self) -> Option<&PromptEmbedding> {
        match &self.conditioning {
            PromptConditioning::Encoded(embedding) => Some(embedding),
            _ => None,
        }
    }
}

/// A region where an image-guided diffusion process is acting.
#[derive(Debug, Clone)]
pub struct Image2ImageRegion {
    canvas: CanvasRegion,
    mask_mode: MaskMode,
    mask_weight: f32,
    reference_image: ImageTensor,
    strength: f32,
    reference_latents: Option<LatentTensor>,
}

impl Image2ImageRegion {
    /// Create an image-guided region.
    ///
    /// The reference image is resized to exactly fill the region's pixel
    /// rectangle; aspect ratio is not preserved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `strength` is outside
    /// `[0.0, 1.0]` or `mask_weight` is not positive.
    pub fn new(
        canvas: CanvasRegion,
        mask_mode: MaskMode,
        mask_weight: f32,
        reference_image: &DynamicImage,
        strength: f32,
    ) -> Result<Self> {
        validate_mask_weight(mask_weight)?;
        if !(0.0..=1.0).contains(&strength) {
            return Err(Error::InvalidParameter {
                name: "strength".to_string(),
                reason: format!("must be between 0.0 and 1.0, got {strength}"),
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let reference_image =
            image_to_tensor(reference_image, canvas.width() as u32, canvas.height() as u32);

        Ok(Self {
            canvas,
            mask_mode,
            mask_weight,
            reference_image,
            strength,
            reference_latents: None,
        })
    }

    /// The pixel rectangle this region covers.
    #[must_use]
    pub const fn canvas(&self) -> &CanvasRegion {
        &self.canvas
    }

    /// Mask shape used when blending this region with its neighbours.
    #[must_use]
    pub const fn mask_mode(&self) -> MaskMode {
        self.mask_mode
    }

    /// Mask strength multiplier.
    #[must_use]
    pub const fn mask_weight(&self) -> f32 {
        self.mask_weight
    }

    /// The reference image, resized to the region and normalized to [-1, 1].
    #[must_use]
    pub const fn reference_image(&self) -> &ImageTensor {
        &self.reference_image
    }

    /// Fraction of the schedule over which the reference dominates.
    #[must_use]
    pub const fn strength(&self) -> f32 {
        self.strength
    }

    /// Encode the reference image into latent space.
    ///
    /// The encoder samples from the latent distribution, so two calls on
    /// the same reference produce different latents; the result is not
    /// cached across calls.
    ///
    /// # Errors
    ///
    /// Propagates encoder failures.
    pub fn encode_reference_image(&mut self, encoder: &mut dyn ImageEncoder) -> Result<()> {
        self.reference_latents = Some(encoder.encode(&self.reference_image)?);
        Ok(())
    }

    /// The encoded reference latents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReferenceNotEncoded`] if
    /// [`encode_reference_image`](Self::encode_reference_image) has not
    /// been called.
    pub fn reference_latents(&self) -> Result<&LatentTensor> {
        self.reference_latents.as_ref().ok_or(Error::ReferenceNotEncoded)
    }
}

/// A region where a diffusion process is acting, dispatched by kind.
#[derive(Debug, Clone)]
pub enum DiffusionRegion {
    /// Text-prompt driven region.
    Text2Image(Text2ImageRegion),
    /// Reference-image driven region.
    Image2Image(Image2ImageRegion),
}

impl DiffusionRegion {
    /// The pixel rectangle this region covers.
    #[must_use]
    pub const fn canvas(&self) -> &CanvasRegion {
        match self {
            Self::Text2Image(region) => region.canvas(),
            Self::Image2Image(region) => region.canvas(),
        }
    }

    /// Mask shape used when blending this region with its neighbours.
    #[must_use]
    pub const fn mask_mode(&self) -> MaskMode {
        match self {
            Self::Text2Image(region) => region.mask_mode(),
            Self::Image2Image(region) => region.mask_mode(),
        }
    }

    /// Mask strength multiplier.
    #[must_use]
    pub const fn mask_weight(&self) -> f32 {
        match self {
            Self::Text2Image(region) => region.mask_weight(),
            Self::Image2Image(region) => region.mask_weight(),
        }
    }
}

impl From<Text2ImageRegion> for DiffusionRegion {
    fn from(region: Text2ImageRegion) -> Self {
        Self::Text2Image(region)
    }
}

impl From<Image2ImageRegion> for DiffusionRegion {
    fn from(region: Image2ImageRegion) -> Self {
        Self::Image2Image(region)
    }
}

fn validate_mask_weight(mask_weight: f32) -> Result<()> {
    if mask_weight <= 0.0 || !mask_weight.is_finite() {
        return Err(Error::InvalidParameter {
            name: "mask_weight".to_string(),
            reason: format!("must be a positive finite value, got {mask_weight}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_latent_bounds_floor_division() {
        let region = CanvasRegion::new(0, 512, 100, 356).unwrap();

        assert_eq!(region.latent_row_init(), 0);
        assert_eq!(region.latent_row_end(), 64);
        assert_eq!(region.latent_col_init(), 12);
        assert_eq!(region.latent_col_end(), 44);
        assert_eq!(region.latent_height(), 64);
        assert_eq!(region.latent_width(), 32);
    }

    #[test]
    fn test_latent_bounds_unaligned_edges() {
        // 5..13 spans 8 pixels but floor-divides to a 1-wide latent extent
        let region = CanvasRegion::new(5, 13, 0, 8).unwrap();

        assert_eq!(region.latent_row_init(), 0);
        assert_eq!(region.latent_row_end(), 1);
        assert!(region.latent_row_end() > region.latent_row_init());
    }

    #[test]
    fn test_rejects_inverted_rows() {
        assert!(matches!(
            CanvasRegion::new(100, 50, 0, 64),
            Err(Error::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_columns() {
        assert!(matches!(
            CanvasRegion::new(0, 64, 32, 32),
            Err(Error::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_strength_out_of_range() {
        let canvas = CanvasRegion::new(0, 64, 0, 64).unwrap();
        let img = DynamicImage::new_rgb8(64, 64);

        let err = Image2ImageRegion::new(canvas, MaskMode::Constant, 1.0, &img, 1.5);
        assert!(matches!(err, Err(Error::InvalidParameter { ref name, .. }) if name == "strength"));

        let err = Image2ImageRegion::new(canvas, MaskMode::Constant, 1.0, &img, -0.1);
        assert!(matches!(err, Err(Error::InvalidParameter { ref name, .. }) if name == "strength"));
    }

    #[test]
    fn test_strength_bounds_inclusive() {
        let canvas = CanvasRegion::new(0, 64, 0, 64).unwrap();
        let img = DynamicImage::new_rgb8(64, 64);

        assert!(Image2ImageRegion::new(canvas, MaskMode::Constant, 1.0, &img, 0.0).is_ok());
        assert!(Image2ImageRegion::new(canvas, MaskMode::Constant, 1.0, &img, 1.0).is_ok());
    }

    #[test]
    fn test_reference_resized_to_region() {
        let canvas = CanvasRegion::new(0, 64, 0, 128).unwrap();
        let img = DynamicImage::new_rgb8(300, 200);

        let region = Image2ImageRegion::new(canvas, MaskMode::Constant, 1.0, &img, 0.5).unwrap();
        assert_eq!(region.reference_image().shape(), &[1, 3, 64, 128]);
    }

    #[test]
    fn test_rejects_nonpositive_mask_weight() {
        let canvas = CanvasRegion::new(0, 64, 0, 64).unwrap();
        let err = Text2ImageRegion::new(canvas, MaskMode::Gaussian, 0.0, "a tree", 7.5);
        assert!(matches!(err, Err(Error::InvalidParameter { ref name, .. }) if name == "mask_weight"));
    }

    #[test]
    fn test_encode_before_tokenize_fails() {
        struct NullEncoder;
        impl TextEncoder for NullEncoder {
            fn encode(&mut self, _tokens: &TokenizedPrompt) -> Result<PromptEmbedding> {
                Ok(Array3::zeros((1, 4, 8)))
            }
        }

        let canvas = CanvasRegion::new(0, 64, 0, 64).unwrap();
        let mut region =
            Text2ImageRegion::new(canvas, MaskMode::Constant, 1.0, "a tree", 7.5).unwrap();

        let mut encoder = NullEncoder;
        assert!(matches!(
            region.encode_prompt(&mut encoder),
            Err(Error::PromptNotTokenized)
        ));
    }

    #[test]
    fn test_guidance_pairing_before_encode_fails() {
        let canvas = CanvasRegion::new(0, 64, 0, 64).unwrap();
        let mut region =
            Text2ImageRegion::new(canvas, MaskMode::Constant, 1.0, "a tree", 7.5).unwrap();

        let uncond = Array3::zeros((1, 4, 8));
        assert!(matches!(
            region.prepend_unconditional(uncond),
            Err(Error::PromptNotEncoded)
        ));
    }

    #[test]
    fn test_reference_latents_before_encode_fails() {
        let canvas = CanvasRegion::new(0, 64, 0, 64).unwrap();
        let img = DynamicImage::new_rgb8(64, 64);
        let region = Image2ImageRegion::new(canvas, MaskMode::Constant, 1.0, &img, 0.5).unwrap();

        assert!(matches!(
            region.reference_latents(),
            Err(Error::ReferenceNotEncoded)
        ));
    }
}
