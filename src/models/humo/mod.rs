//! HuMo: text / image / audio conditioned video diffusion.

pub mod audio;
pub mod conditioning;
pub mod mock;
pub mod offload;
pub mod pipeline;
pub mod reference;
pub mod runner;
pub mod scheduler;

pub use audio::{AudioFeatureExtractor, PrecomputedAudioFeatures};
pub use conditioning::{ConditionSet, ConditioningBundle, GuidanceScales, compose_guidance};
pub use offload::{DeviceScope, MemoryOrchestrator, Offload, Residency};
pub use pipeline::{
    DiffusionTransformer, DitOutput, GeneratedVideo, HumoPipeline, InferenceRequest, Scheduler,
    TextEncoder, VideoVae,
};
pub use reference::ZeroLatentTemplate;
pub use runner::{GenerationJob, RunSummary, inference_loop, load_jobs};
pub use scheduler::{FlowUniPCMultistepScheduler, FlowUniPCSchedulerConfig};
