// Orchestration system - provider selection, prompt composition, moderation
// and accelerator arbitration for game-content generation

pub mod arbiter;
pub mod catalog;
pub mod composer;
pub mod error;
pub mod moderation;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod types;

pub use arbiter::{ArbiterError, ArbiterLease, ArbiterStats, DeviceHold, ResidentModel, ResourceArbiter};
pub use composer::PromptComposer;
pub use error::{GenerationError, ProviderError, Stage};
pub use moderation::{ModerationDomain, ModerationGate};
pub use orchestrator::{HealthReport, ModelSummary, Orchestrator, OrchestratorSettings};
pub use registry::{ProviderDescriptor, ProviderRegistry, RegisteredProvider, RegistryBuilder, RegistryError};
pub use types::*;
