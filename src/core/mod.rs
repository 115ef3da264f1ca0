//! Core domain models for the release pipeline
//!
//! This module defines the fundamental data structures that represent
//! pipelines, stages, actions, artifacts and run state.

pub mod artifact;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod stage;
pub mod state;

pub use artifact::*;
pub use context::*;
pub use error::*;
pub use pipeline::*;
pub use stage::*;
pub use state::*;
