//! dweave: a dynamic tracing toolchain.
//!
//! dweave compiles the D instrumentation language into safe, verifiable
//! in-kernel programs, attaches them to probe points, and reassembles
//! the per-CPU trace and aggregation streams for a consumer. This crate
//! is the embedding surface; the heavy lifting lives in the
//! subsystem crates:
//!
//! - [`dweave_dif`]: the intermediate representation, assembler,
//!   register allocator, tables, and object model;
//! - [`dweave_obj`]: the precompiled support routines and the linker;
//! - [`dweave_runtime`]: maps, dynamic variables, aggregation,
//!   speculation, ring buffers, and the consumer loop.
//!
//! The shape of an embedding:
//!
//! ```
//! use dweave::ast::Ast;
//! use dweave::stmt::{Action, Clause};
//! use dweave::{Options, Session};
//! use dweave_runtime::probe::ProbeDesc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut session = Session::simulated(Options::default(), 2);
//!
//! let mut ast = Ast::new();
//! let value = ast.builtin(dweave_dif::vartab::Builtin::Timestamp);
//! let stid = session.compile(
//!     &ast,
//!     &Clause {
//!         probe: ProbeDesc::new("profile", "", "", "tick-1s")?,
//!         predicate: None,
//!         actions: vec![Action::Trace(value)],
//!     },
//! )?;
//! session.go()?;
//! # let _ = stid;
//! # Ok(())
//! # }
//! ```

pub mod ast;
pub mod cg;
pub mod debug;
pub mod options;
pub mod session;
pub mod stmt;

pub use crate::cg::CompileError;
pub use crate::debug::{DebugRing, DebugSink, LogSink};
pub use crate::options::{Options, OptionError};
pub use crate::session::{Drops, Session};

// Re-export the subsystem crates so embedders need only one
// dependency.
pub use dweave_dif;
pub use dweave_obj;
pub use dweave_runtime;
