//! snipgen - copy-and-patch snippet extraction and template generation.
//!
//! snipgen turns small C functions ("snippets") into byte templates with
//! relocation holes, and emits Rust routines that stamp those templates into a
//! code buffer at JIT time. Snippets are compiled with the GHC calling
//! convention and guaranteed tail calls, once per register-pressure variant, so
//! control passes between stamped snippets with plain jumps and live values
//! stay in fixed registers.
//!
//! # Primary Usage
//!
//! ```ignore
//! use snipgen::core::GenConfig;
//! use snipgen::pipeline::{generate, write_artifact};
//! use snipgen::snippet::registry;
//! use snipgen::toolchain::Clang;
//! use snipgen::transform::TextualRewriter;
//!
//! let config = GenConfig::default();
//! let clang = Clang::new(&config.toolchain);
//! let source = generate(registry::builtin(), &clang, &TextualRewriter, &config)?;
//! write_artifact("snippets.rs".as_ref(), &source)?;
//! ```
//!
//! Generated routines are used together with the [`stamp`] runtime:
//!
//! ```ignore
//! use snipgen::stamp::{CodeBuffer, Cont, Fixup};
//!
//! let mut buf = CodeBuffer::new(base);
//! let exit = Fixup::for_buffer(&buf);
//! snip_add(2, &mut buf, Cont::Pending(&exit));
//! let target = buf.position();
//! snip_return_void(2, &mut buf);
//! exit.resolve(&mut buf, target)?;
//! ```
//!
//! # Architecture
//!
//! - [`snippet`] - Declarative snippet definitions and the built-in registry
//! - [`synth`] - Per-variant C source synthesis
//! - [`transform`] - Calling-convention rewriting of LLVM IR
//! - [`toolchain`] - clang driver
//! - [`inspect`] - COFF/ELF code and relocation extraction
//! - [`emit`] - Templates, fallthrough elision and Rust code generation
//! - [`stamp`] - Runtime patch protocol used by generated code
//! - [`pipeline`] - Generation run driver
//! - [`core`] - Errors and configuration
//! - [`x64`] - Register table and instruction decoding

pub mod core;
pub mod emit;
pub mod inspect;
pub mod pipeline;
pub mod snippet;
pub mod stamp;
pub mod synth;
pub mod toolchain;
pub mod transform;
pub mod x64;

pub use crate::core::{GenConfig, GenError, GenResult, VariantKey};
pub use emit::{SnippetTemplates, Template};
pub use snippet::SnippetDef;
pub use stamp::{CodeBuffer, Cont, Fixup, StampError};
