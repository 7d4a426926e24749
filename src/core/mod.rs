// This module is the hub for the infrastructure shared by every pipeline stage: the error
// taxonomy of a generation run (GenError, GenResult and the VariantKey that tags every
// diagnostic with a snippet name and variant index) and the run configuration (toolchain
// location, object format, addressing models and emitter settings). Nothing in here talks to
// an external process or touches the filesystem.

//! Core snippet generator infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - One fatal error enum for the whole run
//! - [`VariantKey`] naming the snippet variant every diagnostic is about
//!
//! ## Configuration (`config`)
//! - Toolchain location and object format
//! - Addressing models
//! - Emitter settings

pub mod config;
pub mod error;

pub use config::{CodeModel, EmitConfig, GenConfig, TargetFormat, ToolchainConfig};
pub use error::{GenError, GenResult, VariantKey};
