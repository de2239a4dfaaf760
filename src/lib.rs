//! Canvas node: one peer of a replicated drawing canvas.
//!
//! Wraps the `canvas_mesh` engine with YAML configuration, command line
//! overrides, logging, TCP links to the configured peers and a line-oriented
//! console standing in for the drawing surface.

pub mod cli;
pub mod config;
pub mod console;
pub mod logging;
pub mod node;

pub use canvas_mesh as mesh;
