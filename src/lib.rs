#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod client;
pub mod config;
mod context;
mod error;
pub mod fabric;
pub mod latency;
pub mod metrics;
pub mod peer;
mod server;
pub mod signal;
pub mod strategy;

pub use client::{Pacing, VirtualClient};
pub use config::{presets, ClientGroup, Config, LatencyProfile, ServerGroup};
pub use context::BenchmarkContext;
pub use error::{ChooseError, Error, RequestError};
pub use metrics::RunReport;
pub use peer::PeerId;
pub use server::VirtualServer;
pub use strategy::StrategyRegistry;

/// Chooserbench crate result.
pub type Result<T, E = Error> = std::result::Result<T, E>;
