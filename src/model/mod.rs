//! Interfaces to the frozen model components, plus ONNX-backed
//! implementations.
//!
//! The compositor never looks inside the denoising network, the text
//! encoder, or the image autoencoder; it drives them through the traits
//! defined here. [`onnx`] provides implementations backed by the Stable
//! Diffusion 1.5 ONNX exports, downloaded and cached by [`loader`].

mod loader;
mod onnx;

pub use loader::{ModelCache, ModelType};
pub use onnx::{
    ClipTokenizer, OnnxDenoiser, OnnxImageDecoder, OnnxImageEncoder, OnnxTextEncoder,
};

use ndarray::{Array3, Array4};

use crate::error::Result;
use crate::image::ImageTensor;

/// Latent tensor in NCHW format (batch, channels, latent height, latent width).
pub type LatentTensor = Array4<f32>;

/// Prompt embedding shaped (batch, sequence, hidden).
pub type PromptEmbedding = Array3<f32>;

/// Token ids for a prompt, padded to a fixed length with truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedPrompt {
    /// Padded, truncated token ids.
    pub ids: Vec<u32>,
}

impl TokenizedPrompt {
    /// Number of tokens, including padding.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the prompt holds no tokens at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Frozen text tokenizer.
pub trait Tokenizer {
    /// The model's maximum sequence length.
    fn model_max_length(&self) -> usize;

    /// Tokenize `text`, padding to `max_length` and truncating past it.
    ///
    /// # Errors
    ///
    /// Tokenizer failures propagate uncaught.
    fn tokenize(&self, text: &str, max_length: usize) -> Result<TokenizedPrompt>;
}

/// Frozen text encoder mapping token ids to embeddings.
pub trait TextEncoder {
    /// Encode token ids into a `(1, sequence, hidden)` embedding.
    ///
    /// # Errors
    ///
    /// Encoder failures propagate uncaught.
    fn encode(&mut self, tokens: &TokenizedPrompt) -> Result<PromptEmbedding>;
}

/// Frozen image encoder mapping pixels into the latent space.
pub trait ImageEncoder {
    /// Draw one latent sample for the given image. The sampling is
    /// stochastic: repeated calls yield different latents.
    ///
    /// # Errors
    ///
    /// Encoder failures propagate uncaught.
    fn encode(&mut self, image: &ImageTensor) -> Result<LatentTensor>;
}

/// Frozen latent decoder mapping latents back to pixels.
pub trait ImageDecoder {
    /// Decode latents to a pixel tensor in [-1, 1].
    ///
    /// When `cpu` is set, decoding is routed through a CPU-resident
    /// session if the implementation carries one, trading speed for
    /// accelerator memory.
    ///
    /// # Errors
    ///
    /// Decoder failures propagate uncaught.
    fn decode(&mut self, latents: &LatentTensor, cpu: bool) -> Result<ImageTensor>;
}

/// Frozen denoising network.
pub trait Denoiser {
    /// Number of channels in the network's latent space.
    fn latent_channels(&self) -> usize;

    /// Predict the noise residual for a latent batch at a timestep under
    /// the given conditioning. The output has the same shape as the input.
    ///
    /// # Errors
    ///
    /// Denoiser failures propagate uncaught.
    fn predict_noise(
        &mut self,
        latents: &LatentTensor,
        timestep: i64,
        encoder_hidden_states: &PromptEmbedding,
    ) -> Result<LatentTensor>;
}
