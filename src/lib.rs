//! taleforge - generation backend for an AI-run tabletop adventure
//!
//! Turns one game event into a narrative turn, a scene illustration,
//! synthesized speech or a transcript, using remote API models and
//! locally hosted ones that share a single accelerator.

pub mod config;
pub mod orchestration;

pub use config::{Credentials, TaleforgeConfig};
pub use orchestration::{GenerationError, GenerationRequest, Orchestrator};
