//! Variable records and the per-object variable table.
//!
//! Every D variable referenced by a compiled object gets a record here:
//! its 32-bit id, scope, static type, and the instruction window over
//! which it is live. The lifetime window is what the code generator's
//! register-allocation decisions key off, and the runtime's map planner
//! sizes the variable maps from the id ranges.

use bitflags::bitflags;
use core::fmt;

/// First id available to user-defined variables. Everything below is
/// reserved for built-ins.
pub const VAR_UBASE: u32 = 0x0500;

/// Built-in variables with reserved ids below [`VAR_UBASE`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum Builtin {
    /// Address of the current kernel task.
    Curthread,
    /// Nanosecond timestamp, latched once per probe firing.
    Timestamp,
    /// Enabled-probe id of the firing ECB.
    Epid,
    /// Probe id of the firing probe.
    Prid,
    /// Probe argument 0 through 9.
    Arg(u8),
    /// Depth of the kernel stack at the probe site.
    Stackdepth,
    /// Process id.
    Pid,
    /// Thread id.
    Tid,
    /// Real user id.
    Uid,
    /// Real group id.
    Gid,
    /// Id of the CPU the probe fired on.
    Curcpu,
}

impl Builtin {
    const ARG0: u32 = 0x0110;

    /// The reserved variable id.
    pub fn id(self) -> u32 {
        match self {
            Builtin::Curthread => 0x0100,
            Builtin::Timestamp => 0x0101,
            Builtin::Epid => 0x0102,
            Builtin::Prid => 0x0103,
            Builtin::Arg(n) => {
                debug_assert!(n < 10);
                Self::ARG0 + u32::from(n)
            }
            Builtin::Stackdepth => 0x0120,
            Builtin::Pid => 0x0121,
            Builtin::Tid => 0x0122,
            Builtin::Uid => 0x0123,
            Builtin::Gid => 0x0124,
            Builtin::Curcpu => 0x0125,
        }
    }

    /// Map an id back to the built-in it names.
    pub fn from_id(id: u32) -> Option<Builtin> {
        Some(match id {
            0x0100 => Builtin::Curthread,
            0x0101 => Builtin::Timestamp,
            0x0102 => Builtin::Epid,
            0x0103 => Builtin::Prid,
            n @ 0x0110..=0x0119 => Builtin::Arg((n - Self::ARG0) as u8),
            0x0120 => Builtin::Stackdepth,
            0x0121 => Builtin::Pid,
            0x0122 => Builtin::Tid,
            0x0123 => Builtin::Uid,
            0x0124 => Builtin::Gid,
            0x0125 => Builtin::Curcpu,
            _ => return None,
        })
    }

    /// The source-level name.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Curthread => "curthread",
            Builtin::Timestamp => "timestamp",
            Builtin::Epid => "epid",
            Builtin::Prid => "id",
            Builtin::Arg(0) => "arg0",
            Builtin::Arg(1) => "arg1",
            Builtin::Arg(2) => "arg2",
            Builtin::Arg(3) => "arg3",
            Builtin::Arg(4) => "arg4",
            Builtin::Arg(5) => "arg5",
            Builtin::Arg(6) => "arg6",
            Builtin::Arg(7) => "arg7",
            Builtin::Arg(8) => "arg8",
            Builtin::Arg(_) => "arg9",
            Builtin::Stackdepth => "stackdepth",
            Builtin::Pid => "pid",
            Builtin::Tid => "tid",
            Builtin::Uid => "uid",
            Builtin::Gid => "gid",
            Builtin::Curcpu => "curcpu",
        }
    }
}

/// The kind of a variable's static type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum TypeKind {
    /// Integer of some width.
    Int,
    /// Pointer into kernel or user memory.
    Ptr,
    /// A D string.
    Str,
}

bitflags! {
    /// Type attribute flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct TypeFlags: u8 {
        /// Signed integer.
        const SIGNED = 0x1;
        /// Passed by reference; the value is the address of the data.
        const BYREF = 0x2;
        /// Refers to user-space memory.
        const USER = 0x4;
    }
}

/// The static type carried by variables and expression results.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DifType {
    /// Kind of the type.
    pub kind: TypeKind,
    /// Size in bytes.
    pub size: u32,
    /// Attribute flags.
    pub flags: TypeFlags,
}

impl DifType {
    /// A signed 64-bit integer, the default D expression type.
    pub fn i64() -> Self {
        DifType {
            kind: TypeKind::Int,
            size: 8,
            flags: TypeFlags::SIGNED,
        }
    }

    /// A D string of at most `size` bytes.
    pub fn string(size: u32) -> Self {
        DifType {
            kind: TypeKind::Str,
            size,
            flags: TypeFlags::BYREF,
        }
    }
}

/// Storage scope of a variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum VarScope {
    /// Session-global scalar.
    Global,
    /// Thread-local scalar.
    Thread,
    /// Associative-array element, addressed by a key tuple.
    Assoc,
    /// Clause-local scratch.
    Local,
    /// Built-in, materialized by the support library.
    Builtin,
}

/// Scalar versus keyed variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum VarKind {
    /// A single value.
    Scalar,
    /// An associative array.
    Array,
}

bitflags! {
    /// Usage flags accumulated during compilation.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct VarFlags: u16 {
        /// The variable is read somewhere in the object.
        const REF = 0x1;
        /// The variable is written somewhere in the object.
        const MOD = 0x2;
    }
}

/// One variable record.
#[derive(Clone, Debug)]
pub struct Variable {
    /// Offset of the variable's name in the object's string table.
    pub name: u32,
    /// The variable id.
    pub id: u32,
    /// Scalar or array.
    pub kind: VarKind,
    /// Storage scope.
    pub scope: VarScope,
    /// First instruction index at which the variable is live.
    pub insn_from: u32,
    /// Last instruction index at which the variable is live.
    pub insn_to: u32,
    /// Usage flags.
    pub flags: VarFlags,
    /// Static type.
    pub ty: DifType,
}

/// The per-object variable table.
///
/// Records are keyed by `(id, scope, kind)`; re-inserting an existing
/// variable widens its lifetime window and merges its flags.
#[derive(Clone, Debug, Default)]
pub struct VarTable {
    vars: Vec<Variable>,
}

impl VarTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a variable record.
    pub fn lookup(&self, id: u32, scope: VarScope, kind: VarKind) -> Option<&Variable> {
        self.vars
            .iter()
            .find(|v| v.id == id && v.scope == scope && v.kind == kind)
    }

    /// Insert or merge a variable record, returning its index.
    pub fn insert(&mut self, var: Variable) -> usize {
        if let Some(idx) = self
            .vars
            .iter()
            .position(|v| v.id == var.id && v.scope == var.scope && v.kind == var.kind)
        {
            let prior = &mut self.vars[idx];
            prior.insn_from = prior.insn_from.min(var.insn_from);
            prior.insn_to = prior.insn_to.max(var.insn_to);
            prior.flags |= var.flags;
            return idx;
        }
        self.vars.push(var);
        self.vars.len() - 1
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate over the records.
    pub fn iter(&self) -> core::slice::Iter<'_, Variable> {
        self.vars.iter()
    }

    /// The highest id in use for `scope`, if any variable has it.
    pub fn max_id(&self, scope: VarScope) -> Option<u32> {
        self.vars
            .iter()
            .filter(|v| v.scope == scope)
            .map(|v| v.id)
            .max()
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
