//! Object linking for dweave.
//!
//! The compiler emits one [`Difo`](dweave_dif::Difo) per clause; the
//! kernel wants one self-contained program per ECB. This crate closes
//! the gap:
//!
//! - [`dlib`] is the precompiled support-routine library: the dynamic
//!   variable, aggregation, speculation, and fault plumbing that clause
//!   code calls into, expressed as objects in the same dialect.
//! - [`linker`] lays a clause and its transitively referenced support
//!   routines out into one instruction stream, resolves call
//!   relocations to instruction deltas, merges string tables into the
//!   session table, and patches link-time constants.
//! - [`program`] is the result: a loadable program whose only remaining
//!   relocations are the map descriptors the kernel substitutes at load
//!   time.

#![forbid(unsafe_code)]

pub mod dlib;
pub mod linker;
pub mod program;

pub use crate::dlib::{Dlib, DlibSym};
pub use crate::linker::{LinkParams, Linker};
pub use crate::program::Program;

use thiserror::Error;

/// Errors produced while linking a clause into a loadable program.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A call referenced a symbol the support library does not define.
    #[error("undefined support symbol {0}")]
    UndefinedSymbol(u32),

    /// The linked program exceeds the instruction-count cap the
    /// verifier will accept.
    #[error("linked program has {len} instructions, exceeding the cap of {cap}")]
    ProgramTooLong {
        /// Number of instructions after linking.
        len: usize,
        /// Configured cap.
        cap: usize,
    },

    /// A string-table offset referenced bytes that do not exist in the
    /// owning object's table.
    #[error("dangling string-table offset {0}")]
    DanglingString(u32),
}
