pub mod agent;
pub mod config;
pub mod containment;
pub mod context;
pub mod diff;
pub mod entropy;
pub mod error;
pub mod git;
pub mod lifecycle;
pub mod pipeline;
pub mod policy;
pub mod retro;
pub mod sandbox;
pub mod source;
pub mod store;
pub mod types;
pub mod verify;

pub use types::*;
