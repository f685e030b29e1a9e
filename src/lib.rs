//! # diffusion-canvas
//!
//! A region-compositing extension for latent-diffusion image generation.
//!
//! The caller partitions a canvas into overlapping rectangular regions,
//! each driven by a text prompt or a reference image, and the
//! [`CanvasPipeline`] blends their per-step noise predictions into one
//! coherent latent canvas across the reverse-diffusion schedule. The
//! frozen model components (tokenizer, text encoder, image autoencoder,
//! denoiser) and the noise scheduler are external collaborators behind
//! traits; ONNX-backed implementations of the model components are
//! provided in [`model`].
//!
//! ## Example
//!
//! ```no_run
//! use diffusion_canvas::{
//!     CanvasPipeline, CanvasRegion, GenerateConfig, MaskMode, Text2ImageRegion,
//! };
//!
//! # fn scheduler() -> Box<dyn diffusion_canvas::Scheduler> { unimplemented!() }
//! # fn main() -> diffusion_canvas::Result<()> {
//! let mut pipeline = CanvasPipeline::with_onnx_models(scheduler())?;
//!
//! let left = Text2ImageRegion::new(
//!     CanvasRegion::new(0, 512, 0, 384)?,
//!     MaskMode::Gaussian,
//!     1.0,
//!     "a charcoal drawing of a mountain",
//!     7.5,
//! )?;
//! let right = Text2ImageRegion::new(
//!     CanvasRegion::new(0, 512, 256, 640)?,
//!     MaskMode::Gaussian,
//!     1.0,
//!     "a watercolor lake at dusk",
//!     7.5,
//! )?;
//!
//! let config = GenerateConfig {
//!     canvas_height: 512,
//!     canvas_width: 640,
//!     seed: Some(42),
//!     ..GenerateConfig::default()
//! };
//! let output = pipeline.generate(vec![left.into(), right.into()], &config)?;
//! diffusion_canvas::image::save_image(&output.image, "canvas.png", 95)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod mask;
pub mod model;
pub mod pipeline;
pub mod region;
pub mod scheduler;

pub use error::{Error, Result};
pub use mask::MaskWeightsBuilder;
pub use pipeline::{CanvasPipeline, GenerateConfig, GenerationOutput};
pub use region::{
    CanvasRegion, DiffusionRegion, Image2ImageRegion, MaskMode, Text2ImageRegion,
};
pub use scheduler::Scheduler;
