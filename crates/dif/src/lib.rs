//! The DIF intermediate representation and compiler back-end for dweave.
//!
//! DIF is the program encoding produced by the D compiler: a RISC-like
//! instruction set lowered onto the kernel's BPF bytecode dialect. This
//! crate owns everything between the typed expression tree handed over by
//! the front end and the relocatable object handed to the linker:
//!
//! - the instruction model and its 8-byte wire encoding ([`bpf`]);
//! - the IR builder and single-pass assembler ([`ir`], [`builder`]);
//! - the register allocator with spill/reload ([`regset`]);
//! - the deduplicating string and rodata tables ([`strtab`], [`rodata`]);
//! - the variable table and type model ([`vartab`]);
//! - the compiled object, its relocation classes, and the record
//!   descriptors that let a consumer decode the data stream ([`difo`],
//!   [`metadesc`]);
//! - the variable-length integer codec used for traced strings
//!   ([`varint`]);
//! - a disassembler for the four compiler listing points ([`dis`]).
//!
//! Cross-references inside an object are plain indices into the object's
//! own tables; nothing in this crate talks to the kernel.

#![forbid(unsafe_code)]

pub mod bpf;
pub mod builder;
pub mod difo;
pub mod dis;
pub mod entity;
pub mod ir;
pub mod metadesc;
pub mod regset;
pub mod rodata;
pub mod strtab;
pub mod varint;
pub mod vartab;

pub use crate::bpf::{Insn, Reg};
pub use crate::builder::Builder;
pub use crate::difo::{Difo, LinkConst, MapRef, Reloc, RelocClass, SymId};
pub use crate::ir::{ExternRef, IrList, Label};
pub use crate::regset::{RegSet, SpillOps};

use thiserror::Error;

/// Errors produced while building or assembling a DIF object.
///
/// These are compile-time diagnostics in the sense of the error taxonomy:
/// every variant is attributable to the clause being compiled, and the
/// front end attaches the source position before surfacing them.
#[derive(Debug, Error)]
pub enum DifError {
    /// A label was allocated and referenced but never bound to an
    /// instruction before `finish()`.
    #[error("label L{0} is referenced but was never bound")]
    UnboundLabel(u32),

    /// A label was bound twice.
    #[error("label L{0} bound more than once")]
    RedefinedLabel(u32),

    /// A branch displacement does not fit in the 16 signed bits the
    /// instruction format provides. The clause must be split.
    #[error("branch at instruction {insn} to instruction {target} exceeds the ±32767 displacement range")]
    BranchOutOfRange {
        /// Index of the branching instruction.
        insn: u32,
        /// Index of the branch target.
        target: u32,
    },

    /// A 64-bit immediate load is missing its zero-filled high-half
    /// sentinel slot.
    #[error("wide immediate at instruction {0} is not followed by its sentinel slot")]
    MissingWideSentinel(u32),

    /// The string table exceeded the configured size cap.
    #[error("string table size {size} exceeds the configured cap of {cap} bytes")]
    StringTableFull {
        /// Size the table would have grown to.
        size: usize,
        /// Configured cap.
        cap: usize,
    },

    /// Too many variables for the 32-bit id namespace partition.
    #[error("variable id space exhausted in scope {0}")]
    VarIdExhausted(&'static str),

    /// The register file is exhausted: every register is active and has
    /// already been spilled.
    #[error("out of registers: all registers are active and spilled")]
    RegistersExhausted,

    /// A specific register was requested but is active and already
    /// spilled.
    #[error("register {0} is unavailable (active and spilled)")]
    RegisterUnavailable(Reg),

    /// Malformed varint input.
    #[error("truncated or malformed variable-length integer")]
    BadVarint,
}

/// Convenience result alias used throughout the crate.
pub type DifResult<T> = Result<T, DifError>;
