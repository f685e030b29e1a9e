//! Region-compositing reverse-diffusion pipeline.

mod canvas;

pub use canvas::{CanvasPipeline, GenerateConfig, GenerationOutput};
