//! Backend intermediate representation.
//!
//! A small handle-based SSA module: one defined function per compilation,
//! plus declarations for every runtime helper the emitted code calls. The
//! [`Builder`](builder::Builder) mirrors the position-and-emit style of a
//! native IR builder so the front-end reads like its driver loop.

mod types;
pub use types::*;

pub mod builder;
pub use builder::Builder;
