//! Minimal client for a locally running Ollama server

mod client;

pub use client::*;
