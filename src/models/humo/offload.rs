//! Device residency of the heavy sub-models.
//!
//! The text encoder, the video VAE, the diffusion transformer and the audio encoder never share
//! the compute device: each `with_*` call moves one model onto the device, runs the closure and
//! moves it back to the offload device, on the error path too.

use candle_core::Device;
use tracing::{debug, warn};

use super::audio::AudioFeatureExtractor;
use super::pipeline::{DiffusionTransformer, TextEncoder, VideoVae};
use crate::error::{PipelineError, Result};

/// A model whose weights can be moved between devices.
pub trait Offload {
    fn move_to(&mut self, device: &Device) -> candle_core::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Offloaded,
    Resident,
}

/// One residency change, in the order it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub model: &'static str,
    pub to: Residency,
}

/// Compute device plus the device models are parked on between uses.
#[derive(Debug, Clone)]
pub struct DeviceScope {
    compute: Device,
    offload: Device,
}

impl DeviceScope {
    pub fn new(compute: Device) -> Self {
        Self {
            compute,
            offload: Device::Cpu,
        }
    }

    pub fn compute(&self) -> &Device {
        &self.compute
    }

    pub fn offload(&self) -> &Device {
        &self.offload
    }

    /// Waits for pending kernels so memory of dropped tensors returns to the allocator.
    pub fn release_transient(&self) -> Result<()> {
        self.compute.synchronize()?;
        Ok(())
    }

    /// Guard that releases transient memory when it goes out of scope.
    pub fn transient(&self) -> TransientGuard<'_> {
        TransientGuard { scope: self }
    }
}

pub struct TransientGuard<'s> {
    scope: &'s DeviceScope,
}

impl Drop for TransientGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.scope.release_transient() {
            warn!(error = %err, "failed to release transient device memory");
        }
    }
}

struct ModelSlot<M: ?Sized> {
    name: &'static str,
    model: Box<M>,
    residency: Residency,
}

impl<M: Offload + ?Sized> ModelSlot<M> {
    fn new(name: &'static str, model: Box<M>) -> Self {
        Self {
            name,
            model,
            residency: Residency::Offloaded,
        }
    }

    fn transition(
        &mut self,
        device: &Device,
        to: Residency,
        history: &mut Vec<Transition>,
    ) -> Result<()> {
        if self.residency == to {
            return Ok(());
        }
        self.model.move_to(device)?;
        self.residency = to;
        history.push(Transition {
            model: self.name,
            to,
        });
        debug!(model = self.name, residency = ?to, "residency change");
        Ok(())
    }
}

/// Owns the heavy models and enforces that at most one of them is resident at a time.
pub struct MemoryOrchestrator<'a> {
    scope: DeviceScope,
    text_encoder: ModelSlot<dyn TextEncoder + 'a>,
    vae: ModelSlot<dyn VideoVae + 'a>,
    dit: ModelSlot<dyn DiffusionTransformer + 'a>,
    audio_encoder: ModelSlot<dyn AudioFeatureExtractor + 'a>,
    history: Vec<Transition>,
}

macro_rules! scoped {
    ($self:ident, $slot:ident, $f:ident) => {{
        $self.ensure_exclusive($self.$slot.name)?;
        let Self {
            scope,
            $slot: slot,
            history,
            ..
        } = $self;
        slot.transition(&scope.compute, Residency::Resident, history)?;
        let out = $f(slot.model.as_mut(), &*scope);
        let unloaded = slot.transition(&scope.offload, Residency::Offloaded, history);
        let out = out?;
        unloaded?;
        scope.release_transient()?;
        Ok(out)
    }};
}

impl<'a> MemoryOrchestrator<'a> {
    pub fn new(
        scope: DeviceScope,
        text_encoder: Box<dyn TextEncoder + 'a>,
        vae: Box<dyn VideoVae + 'a>,
        dit: Box<dyn DiffusionTransformer + 'a>,
        audio_encoder: Box<dyn AudioFeatureExtractor + 'a>,
    ) -> Self {
        Self {
            scope,
            text_encoder: ModelSlot::new("text_encoder", text_encoder),
            vae: ModelSlot::new("vae", vae),
            dit: ModelSlot::new("dit", dit),
            audio_encoder: ModelSlot::new("audio_encoder", audio_encoder),
            history: Vec::new(),
        }
    }

    pub fn scope(&self) -> &DeviceScope {
        &self.scope
    }

    pub fn residency(&self) -> [(&'static str, Residency); 4] {
        [
            (self.text_encoder.name, self.text_encoder.residency),
            (self.vae.name, self.vae.residency),
            (self.dit.name, self.dit.residency),
            (self.audio_encoder.name, self.audio_encoder.residency),
        ]
    }

    /// Latent channels of the VAE; reads metadata only, the VAE stays where it is.
    pub fn vae_z_dim(&self) -> usize {
        self.vae.model.z_dim()
    }

    /// Drains the residency history recorded since the previous call.
    pub fn take_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.history)
    }

    fn ensure_exclusive(&self, requested: &'static str) -> Result<()> {
        match self
            .residency()
            .into_iter()
            .find(|(name, r)| *name != requested && *r == Residency::Resident)
        {
            Some((resident, _)) => Err(PipelineError::Residency {
                requested,
                resident,
            }),
            None => Ok(()),
        }
    }

    pub fn with_text_encoder<R>(
        &mut self,
        f: impl FnOnce(&mut (dyn TextEncoder + 'a), &DeviceScope) -> Result<R>,
    ) -> Result<R> {
        scoped!(self, text_encoder, f)
    }

    pub fn with_vae<R>(
        &mut self,
        f: impl FnOnce(&mut (dyn VideoVae + 'a), &DeviceScope) -> Result<R>,
    ) -> Result<R> {
        scoped!(self, vae, f)
    }

    pub fn with_dit<R>(
        &mut self,
        f: impl FnOnce(&mut (dyn DiffusionTransformer + 'a), &DeviceScope) -> Result<R>,
    ) -> Result<R> {
        scoped!(self, dit, f)
    }

    pub fn with_audio_encoder<R>(
        &mut self,
        f: impl FnOnce(&mut (dyn AudioFeatureExtractor + 'a), &DeviceScope) -> Result<R>,
    ) -> Result<R> {
        scoped!(self, audio_encoder, f)
    }
}
