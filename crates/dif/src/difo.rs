//! The compiled DIF object.
//!
//! A `Difo` is the unit the assembler produces for one D expression or
//! clause: final instructions, frozen string/rodata/variable tables, the
//! relocations left for the linker and the loader, and the record
//! descriptor for the data the object emits. Once a `Difo` is installed
//! on a probe its instructions never change; retargeting means producing
//! a new object.

use bitflags::bitflags;
use core::fmt;

use crate::bpf::Insn;
use crate::entity_ref;
use crate::ir::ExternRef;
use crate::metadesc::DataDesc;
use crate::rodata::RoData;
use crate::strtab::StrTab;
use crate::vartab::{DifType, VarTable};

/// A symbol id naming a support routine in the precompiled library.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct SymId(u32);
entity_ref!(SymId, "sym");

/// The shared maps a program can reference.
///
/// Each role names one map created by the map planner at session start;
/// instructions reference maps symbolically and the loader substitutes
/// the kernel descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum MapRef {
    /// Per-CPU output ring buffers.
    Buffers,
    /// Per-CPU record-assembly scratch.
    Mem,
    /// The session string table, one singleton value.
    Strtab,
    /// Global variables, keyed by variable id.
    Gvars,
    /// Thread-local variable indirection.
    Tvars,
    /// Dynamic variable storage, keyed by 64-bit handle.
    Dvars,
    /// Associative-array key tuples mapping to dvar handles.
    Tuples,
    /// Aggregation storage.
    Aggs,
    /// Per-aggregation generation counters.
    AggGen,
    /// Speculation control blocks.
    Specs,
    /// Session state: drop counters, fault status.
    State,
    /// Per-CPU identity records.
    Cpuinfo,
    /// Per-probe metadata, keyed by probe id.
    Probes,
}

impl MapRef {
    /// The map's name, used in diagnostics and as the kernel object
    /// name.
    pub fn name(self) -> &'static str {
        match self {
            MapRef::Buffers => "buffers",
            MapRef::Mem => "mem",
            MapRef::Strtab => "strtab",
            MapRef::Gvars => "gvars",
            MapRef::Tvars => "tvars",
            MapRef::Dvars => "dvars",
            MapRef::Tuples => "tuples",
            MapRef::Aggs => "aggs",
            MapRef::AggGen => "agggen",
            MapRef::Specs => "specs",
            MapRef::State => "state",
            MapRef::Cpuinfo => "cpuinfo",
            MapRef::Probes => "probes",
        }
    }

    /// All roles, in creation order.
    pub const ALL: [MapRef; 13] = [
        MapRef::Buffers,
        MapRef::Mem,
        MapRef::Strtab,
        MapRef::Gvars,
        MapRef::Tvars,
        MapRef::Dvars,
        MapRef::Tuples,
        MapRef::Aggs,
        MapRef::AggGen,
        MapRef::Specs,
        MapRef::State,
        MapRef::Cpuinfo,
        MapRef::Probes,
    ];
}

impl fmt::Display for MapRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Constants whose values are only known when the object is bound to an
/// ECB and the session tables are final. The linker patches these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum LinkConst {
    /// The enabled-probe id of the ECB the object is bound to.
    Epid,
    /// The probe id of the probe the ECB is attached to.
    Prid,
    /// The statement id within the program.
    Stid,
    /// Number of possible CPUs.
    Ncpus,
    /// Configured number of speculation slots.
    Nspec,
    /// Final size of the session string table.
    StrtabSize,
    /// Maximum record length across the session's programs.
    MaxRecLen,
}

impl LinkConst {
    /// The constant's name, for disassembly.
    pub fn name(self) -> &'static str {
        match self {
            LinkConst::Epid => "EPID",
            LinkConst::Prid => "PRID",
            LinkConst::Stid => "STID",
            LinkConst::Ncpus => "NCPUS",
            LinkConst::Nspec => "NSPEC",
            LinkConst::StrtabSize => "STBSZ",
            LinkConst::MaxRecLen => "RECSZ",
        }
    }
}

/// The three relocation classes, by who resolves them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum RelocClass {
    /// Program-relative: call targets resolved by the linker to
    /// instruction deltas.
    Prog,
    /// Kernel-relative: map descriptors substituted at load time.
    Kernel,
    /// User-relative: constants and string offsets patched at link
    /// time from session state.
    User,
}

/// One relocation: the instruction to patch and the reference to
/// resolve.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct Reloc {
    /// Index of the instruction carrying the reference.
    pub insn: u32,
    /// What the instruction refers to.
    pub target: ExternRef,
}

impl Reloc {
    /// Which class this relocation belongs to.
    pub fn class(&self) -> RelocClass {
        match self.target {
            ExternRef::Sym(_) => RelocClass::Prog,
            ExternRef::Map(_) => RelocClass::Kernel,
            ExternRef::Const(_) | ExternRef::Str(_) => RelocClass::User,
        }
    }
}

bitflags! {
    /// Object attribute flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct DifoFlags: u32 {
        /// The object performs a destructive action.
        const DESTRUCTIVE = 0x1;
        /// The object writes to a speculation buffer.
        const SPECULATIVE = 0x2;
        /// The object updates an aggregation.
        const AGGREGATING = 0x4;
    }
}

/// A compiled object: one D expression or clause.
#[derive(Clone, Debug)]
pub struct Difo {
    /// Final instructions. Branch displacements are resolved; the
    /// relocation tables list what remains symbolic.
    pub insns: Vec<Insn>,
    /// The object's string table, frozen at assembly.
    pub strtab: StrTab,
    /// The object's read-only data, frozen at assembly.
    pub rodata: RoData,
    /// Variables referenced by the object.
    pub vartab: VarTable,
    /// Program-relative relocations (support-routine calls).
    pub brel: Vec<Reloc>,
    /// Kernel-relative relocations (map references).
    pub krel: Vec<Reloc>,
    /// User-relative relocations (link-time constants, string offsets).
    pub urel: Vec<Reloc>,
    /// Descriptor for the record this object emits.
    pub ddesc: DataDesc,
    /// The type of the object's result value.
    pub rtype: DifType,
    /// Attribute flags.
    pub flags: DifoFlags,
}

impl Difo {
    /// Number of instruction slots.
    pub fn len(&self) -> u32 {
        self.insns.len() as u32
    }

    /// Is the object empty?
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// All relocations in class order, program first.
    pub fn relocs(&self) -> impl Iterator<Item = &Reloc> {
        self.brel.iter().chain(self.krel.iter()).chain(self.urel.iter())
    }

    /// The relocation attached to instruction `insn`, if any.
    pub fn reloc_at(&self, insn: u32) -> Option<&Reloc> {
        self.relocs().find(|r| r.insn == insn)
    }

    /// Encode the instructions to their 8-byte wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.insns.len() * crate::bpf::INSN_SIZE);
        for insn in &self.insns {
            bytes.extend_from_slice(&insn.encode());
        }
        bytes
    }
}
