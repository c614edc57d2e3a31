//! Playback-synchronized hydration of translated caption lines.
//!
//! The engine owns a single session and is driven by [`core::EngineEvent`]s.
//! Network work runs in spawned tasks that report back into the same
//! channel; everything else happens on the engine's own task.

pub mod backend;
pub mod cache;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod mode;
pub mod scheduler;
pub mod selection;

pub use crate::backend::{Backend, PlayerProbe, Renderer};
pub use crate::core::{Collaborators, EngineEvent, HydrationEngine};
pub use crate::error::{BackendError, EngineError, HydrationError};
