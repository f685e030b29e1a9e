//! Black-box contract for the external noise scheduler.

use crate::error::Result;
use crate::model::LatentTensor;

/// Contract implemented by the external noise scheduler driving the
/// reverse-diffusion schedule.
///
/// The scheduler's mathematics are out of scope for this crate; only its
/// step/add-noise behavior is assumed. Capability introspection replaces
/// runtime signature probing: a scheduler that understands a one-step
/// time-origin offset reports it via [`accepts_offset`](Self::accepts_offset),
/// and variance-exploding / continuous-ODE schedulers expose their noise
/// levels via [`sigmas`](Self::sigmas).
pub trait Scheduler {
    /// Configure the schedule for the requested number of inference steps.
    ///
    /// `offset` shifts the time origin by the given number of steps;
    /// schedulers that do not accept an offset ignore it.
    fn set_timesteps(&mut self, num_inference_steps: usize, offset: usize);

    /// The ordered timestep sequence, of length equal to the configured
    /// step count.
    fn timesteps(&self) -> &[i64];

    /// Whether [`set_timesteps`](Self::set_timesteps) honors a time-origin
    /// offset.
    fn accepts_offset(&self) -> bool {
        false
    }

    /// Per-step noise levels for continuous-ODE schedulers. `Some` marks
    /// the scheduler as sigma-scaled: initial latents are multiplied by
    /// `sigmas[0]` and denoiser inputs divided by `sqrt(sigma_i^2 + 1)`.
    fn sigmas(&self) -> Option<&[f32]> {
        None
    }

    /// Forward-noise reference latents to the given timestep.
    ///
    /// # Errors
    ///
    /// Scheduler failures propagate uncaught to the caller.
    fn add_noise(
        &self,
        original: &LatentTensor,
        noise: &LatentTensor,
        timestep: i64,
    ) -> Result<LatentTensor>;

    /// Advance latents one reverse-diffusion step given the blended noise
    /// prediction. Discrete schedulers key on `timestep`, sigma-scaled
    /// ones on `step_index`. `eta` is forwarded unconditionally and
    /// ignored by schedulers that do not consume it.
    ///
    /// # Errors
    ///
    /// Scheduler failures propagate uncaught to the caller.
    fn step(
        &mut self,
        model_output: &LatentTensor,
        step_index: usize,
        timestep: i64,
        sample: &LatentTensor,
        eta: f32,
    ) -> Result<LatentTensor>;
}
