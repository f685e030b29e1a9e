//! ONNX-backed implementations of the frozen model interfaces.

use ndarray::{Array1, Array2, Array3, Array4};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer as HfTokenizer;

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::loader::{ModelCache, ModelType};
use super::{
    Denoiser, ImageDecoder, ImageEncoder, LatentTensor, PromptEmbedding, TextEncoder,
    TokenizedPrompt, Tokenizer,
};

/// VAE scaling factor (from Stable Diffusion).
const VAE_SCALE: f32 = 0.18215;

/// Latent channel count of the SD 1.5 `UNet`.
const LATENT_CHANNELS: usize = 4;

/// CLIP maximum sequence length.
const CLIP_MAX_LENGTH: usize = 77;

/// CLIP end-of-text token id, used as padding.
const CLIP_PAD_TOKEN: u32 = 49407;

/// CLIP tokenizer backed by a `tokenizer.json` definition.
pub struct ClipTokenizer {
    tokenizer: HfTokenizer,
    pad_token: u32,
}

impl ClipTokenizer {
    /// Load the tokenizer definition from the model cache, downloading it
    /// if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition cannot be downloaded or parsed.
    pub fn from_cache(cache: &ModelCache) -> Result<Self> {
        let path = cache.get_model_path(ModelType::TokenizerConfig)?;
        let tokenizer = HfTokenizer::from_file(&path).map_err(|source| Error::Tokenizer {
            message: source.to_string(),
        })?;
        let pad_token = tokenizer
            .token_to_id("<|endoftext|>")
            .unwrap_or(CLIP_PAD_TOKEN);

        Ok(Self {
            tokenizer,
            pad_token,
        })
    }
}

impl Tokenizer for ClipTokenizer {
    fn model_max_length(&self) -> usize {
        CLIP_MAX_LENGTH
    }

    fn tokenize(&self, text: &str, max_length: usize) -> Result<TokenizedPrompt> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|source| Error::Tokenizer {
                message: source.to_string(),
            })?;

        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        ids.truncate(max_length);
        ids.resize(max_length, self.pad_token);

        Ok(TokenizedPrompt { ids })
    }
}

/// CLIP text encoder backed by an ONNX session.
pub struct OnnxTextEncoder {
    session: Session,
}

impl OnnxTextEncoder {
    /// Wrap an already-loaded session.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    /// Load the text encoder from the model cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be downloaded or loaded.
    pub fn from_cache(cache: &ModelCache) -> Result<Self> {
        Ok(Self::new(cache.load_session(ModelType::TextEncoder)?))
    }
}

impl TextEncoder for OnnxTextEncoder {
    #[allow(clippy::cast_possible_wrap)]
    fn encode(&mut self, tokens: &TokenizedPrompt) -> Result<PromptEmbedding> {
        let ids: Vec<i32> = tokens.ids.iter().map(|&id| id as i32).collect();
        let input_ids = Array2::from_shape_vec((1, ids.len()), ids).map_err(|_| {
            Error::ShapeMismatch {
                expected: format!("(1, {})", tokens.len()),
                actual: "token id reshape failed".to_string(),
            }
        })?;

        let input_value =
            Tensor::from_array(input_ids).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "last_hidden_state output".to_string(),
                actual: "no output".to_string(),
            })?;

        extract_array3(&output)
    }
}

/// VAE encoder backed by an ONNX session.
///
/// The exported encoder samples from the latent distribution, so each call
/// draws a fresh stochastic latent for the same image.
pub struct OnnxImageEncoder {
    session: Session,
}

impl OnnxImageEncoder {
    /// Wrap an already-loaded session.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    /// Load the VAE encoder from the model cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be downloaded or loaded.
    pub fn from_cache(cache: &ModelCache) -> Result<Self> {
        Ok(Self::new(cache.load_session(ModelType::VaeEncoder)?))
    }
}

impl ImageEncoder for OnnxImageEncoder {
    fn encode(&mut self, image: &ImageTensor) -> Result<LatentTensor> {
        let input_value =
            Tensor::from_array(image.clone()).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "latent_sample output".to_string(),
                actual: "no output".to_string(),
            })?;

        let latent = extract_array4(&output)?;

        // Scale latents as per SD convention
        Ok(latent * VAE_SCALE)
    }
}

/// VAE decoder backed by an ONNX session, with an optional CPU-resident
/// session for memory-constrained decoding.
pub struct OnnxImageDecoder {
    session: Session,
    cpu_session: Option<Session>,
}

impl OnnxImageDecoder {
    /// Wrap an already-loaded session.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self {
            session,
            cpu_session: None,
        }
    }

    /// Load the VAE decoder from the model cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be downloaded or loaded.
    pub fn from_cache(cache: &ModelCache) -> Result<Self> {
        Ok(Self::new(cache.load_session(ModelType::VaeDecoder)?))
    }

    /// Attach a CPU-resident session used when decoding is requested with
    /// the `cpu` flag set.
    #[must_use]
    pub fn with_cpu_session(mut self, session: Session) -> Self {
        self.cpu_session = Some(session);
        self
    }
}

impl ImageDecoder for OnnxImageDecoder {
    fn decode(&mut self, latents: &LatentTensor, cpu: bool) -> Result<ImageTensor> {
        // Unscale latents
        let unscaled = latents / VAE_SCALE;

        let input_value =
            Tensor::from_array(unscaled).map_err(|source| Error::Inference { source })?;

        let session = match (&mut self.cpu_session, cpu) {
            (Some(session), true) => session,
            (_, _) => &mut self.session,
        };

        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "sample output".to_string(),
                actual: "no output".to_string(),
            })?;

        extract_array4(&output)
    }
}

/// `UNet` denoiser backed by an ONNX session.
pub struct OnnxDenoiser {
    session: Session,
}

impl OnnxDenoiser {
    /// Wrap an already-loaded session.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    /// Load the `UNet` from the model cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be downloaded or loaded.
    pub fn from_cache(cache: &ModelCache) -> Result<Self> {
        Ok(Self::new(cache.load_session(ModelType::Unet)?))
    }
}

impl Denoiser for OnnxDenoiser {
    fn latent_channels(&self) -> usize {
        LATENT_CHANNELS
    }

    fn predict_noise(
        &mut self,
        latents: &LatentTensor,
        timestep: i64,
        encoder_hidden_states: &PromptEmbedding,
    ) -> Result<LatentTensor> {
        let sample_value =
            Tensor::from_array(latents.clone()).map_err(|source| Error::Inference { source })?;

        let timestep_arr = Array1::from_vec(vec![timestep]);
        let timestep_value =
            Tensor::from_array(timestep_arr).map_err(|source| Error::Inference { source })?;

        let hidden_value = Tensor::from_array(encoder_hidden_states.clone())
            .map_err(|source| Error::Inference { source })?;

        let outputs = self
            .session
            .run(ort::inputs![
                "sample" => sample_value,
                "timestep" => timestep_value,
                "encoder_hidden_states" => hidden_value,
            ])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "noise prediction output".to_string(),
                actual: "no output".to_string(),
            })?;

        extract_array4(&output)
    }
}

/// Extract a 4D array from an ONNX value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn extract_array4(value: &ort::value::ValueRef<'_>) -> Result<Array4<f32>> {
    let (shape_info, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Inference { source })?;

    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    if dims.len() != 4 {
        return Err(Error::ShapeMismatch {
            expected: "4D tensor".to_string(),
            actual: format!("{}D tensor", dims.len()),
        });
    }

    Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), data.to_vec()).map_err(|_| {
        Error::ShapeMismatch {
            expected: format!("{dims:?}"),
            actual: "reshape failed".to_string(),
        }
    })
}

/// Extract a 3D array from an ONNX value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn extract_array3(value: &ort::value::ValueRef<'_>) -> Result<Array3<f32>> {
    let (shape_info, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Inference { source })?;

    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    if dims.len() != 3 {
        return Err(Error::ShapeMismatch {
            expected: "3D tensor".to_string(),
            actual: format!("{}D tensor", dims.len()),
        });
    }

    Array3::from_shape_vec((dims[0], dims[1], dims[2]), data.to_vec()).map_err(|_| {
        Error::ShapeMismatch {
            expected: format!("{dims:?}"),
            actual: "reshape failed".to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_and_truncate_ids() {
        // Padding behavior is independent of the loaded vocabulary, so
        // exercise it directly on the id buffer.
        let mut ids: Vec<u32> = vec![49406, 320, 2368, 49407];
        ids.truncate(8);
        ids.resize(8, CLIP_PAD_TOKEN);

        assert_eq!(ids.len(), 8);
        assert_eq!(&ids[4..], &[CLIP_PAD_TOKEN; 4]);

        let mut long: Vec<u32> = (0..100).collect();
        long.truncate(8);
        long.resize(8, CLIP_PAD_TOKEN);
        assert_eq!(long.len(), 8);
        assert_eq!(long[7], 7);
    }
}
