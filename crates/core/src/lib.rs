//! Core crate for assembling frame-window extended workflow graphs.

pub mod assembler;
pub mod config;
pub mod engine;
pub mod extend;
pub mod graph;
pub mod logging;
pub mod probe;
pub mod runtime;
pub mod template;
pub mod types;
