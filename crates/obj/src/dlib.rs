//! The precompiled support-routine library.
//!
//! Clause code never touches the shared maps directly; it calls the
//! routines here, which are ordinary objects in the same bytecode
//! dialect. The linker copies whichever routines a clause (transitively)
//! references into the final program, so every loaded program remains
//! self-contained.
//!
//! All routines follow the VM calling convention: arguments in
//! `r1`–`r5`, result in `r0`, `r6`–`r9` preserved across helper calls.
//! Routines that can observe resource exhaustion bump the corresponding
//! drop counter in the `state` map and return the null value rather
//! than faulting.

use dweave_dif::bpf::{self, flag, AluOp, Helper, JmpOp, Reg, Size};
use dweave_dif::builder::Builder;
use dweave_dif::difo::{Difo, LinkConst, MapRef, SymId};
use dweave_dif::entity::{EntityRef, PrimaryMap};
use dweave_dif::ir::ExternRef;
use dweave_dif::metadesc::{state, FaultKind, ERROR_EPID, ERROR_RECORD_SIZE};

/// The well-known support routines, in symbol-id order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DlibSym {
    /// `tls_key(id) -> key`: the 64-bit dynamic-variable key for a
    /// thread-local scalar.
    TlsKey,
    /// `dvar_drop() -> null`: count a dynamic-variable drop.
    DvarDrop,
    /// `dvar_lookup(key, store, nval, dflt) -> *value | null`.
    DvarLookup,
    /// `assoc_lookup(tuple, store, nval, dflt) -> *value | null`.
    AssocLookup,
    /// `gvar_get(id) -> value`.
    GvarGet,
    /// `gvar_set(id, value)`.
    GvarSet,
    /// `tvar_get(id) -> value`.
    TvarGet,
    /// `tvar_set(id, value, dflt)`.
    TvarSet,
    /// `agg_lookup(id, key, ival, dflt) -> *record | null`.
    AggLookup,
    /// `agg_qbin(value) -> bucket`.
    AggQBin,
    /// `agg_lqbin(value, base, levels, step) -> bucket`.
    AggLQBin,
    /// `agg_llqbin(value, factor, low, high, nsteps) -> bucket`.
    AggLLQBin,
    /// `spec_reserve() -> id | 0`.
    SpecReserve,
    /// `spec_mark_drain(ctx, id) -> 0 | -1`.
    SpecMarkDrain,
    /// `spec_note_write(id) -> 0 | -1`.
    SpecNoteWrite,
    /// `probe_error(ctx, pc, fault, illval)`: emit an error record.
    ProbeError,
    /// `memcpy_small(dst, src, len)`: bounded copy via the read helper.
    MemcpySmall,
    /// `strnlen(src, maxlen) -> len | -1`.
    Strnlen,
}

impl DlibSym {
    /// Every routine, in symbol-id order.
    pub const ALL: [DlibSym; 18] = [
        DlibSym::TlsKey,
        DlibSym::DvarDrop,
        DlibSym::DvarLookup,
        DlibSym::AssocLookup,
        DlibSym::GvarGet,
        DlibSym::GvarSet,
        DlibSym::TvarGet,
        DlibSym::TvarSet,
        DlibSym::AggLookup,
        DlibSym::AggQBin,
        DlibSym::AggLQBin,
        DlibSym::AggLLQBin,
        DlibSym::SpecReserve,
        DlibSym::SpecMarkDrain,
        DlibSym::SpecNoteWrite,
        DlibSym::ProbeError,
        DlibSym::MemcpySmall,
        DlibSym::Strnlen,
    ];

    /// The routine's symbol id.
    pub fn sym(self) -> SymId {
        SymId::new(self as usize)
    }

    /// The routine's name, used in listings.
    pub fn name(self) -> &'static str {
        match self {
            DlibSym::TlsKey => "tls_key",
            DlibSym::DvarDrop => "dvar_drop",
            DlibSym::DvarLookup => "dvar_lookup",
            DlibSym::AssocLookup => "assoc_lookup",
            DlibSym::GvarGet => "gvar_get",
            DlibSym::GvarSet => "gvar_set",
            DlibSym::TvarGet => "tvar_get",
            DlibSym::TvarSet => "tvar_set",
            DlibSym::AggLookup => "agg_lookup",
            DlibSym::AggQBin => "agg_qbin",
            DlibSym::AggLQBin => "agg_lqbin",
            DlibSym::AggLLQBin => "agg_llqbin",
            DlibSym::SpecReserve => "spec_reserve",
            DlibSym::SpecMarkDrain => "spec_mark_drain",
            DlibSym::SpecNoteWrite => "spec_note_write",
            DlibSym::ProbeError => "probe_error",
            DlibSym::MemcpySmall => "memcpy_small",
            DlibSym::Strnlen => "strnlen",
        }
    }
}

/// One library routine: its name and compiled object.
#[derive(Debug)]
pub struct DlibFn {
    /// Symbol name.
    pub name: &'static str,
    /// Compiled body.
    pub difo: Difo,
}

/// The support-routine library.
#[derive(Debug)]
pub struct Dlib {
    funcs: PrimaryMap<SymId, DlibFn>,
}

impl Dlib {
    /// Build the standard library.
    pub fn standard() -> Self {
        let mut funcs = PrimaryMap::new();
        for sym in DlibSym::ALL {
            let difo = build(sym);
            debug_assert_eq!(funcs.next_key(), sym.sym());
            funcs.push(DlibFn {
                name: sym.name(),
                difo,
            });
        }
        log::debug!("built support library: {} routines", funcs.len());
        Dlib { funcs }
    }

    /// The routine with symbol id `sym`, if defined.
    pub fn get(&self, sym: SymId) -> Option<&DlibFn> {
        self.funcs.get(sym)
    }

    /// Number of routines.
    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    /// The library is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for Dlib {
    fn default() -> Self {
        Self::standard()
    }
}

// --- emission helpers ----------------------------------------------------

/// Load the descriptor of `map` into `r1`.
fn map_arg(b: &mut Builder, map: MapRef) {
    b.ir.append_wide_xref(
        bpf::lddw_pseudo(Reg::R1, Reg::new(bpf::pseudo::MAP_FD), 0),
        ExternRef::Map(map),
    );
}

/// `dst = %fp + off`.
fn fp_addr(b: &mut Builder, dst: Reg, off: i32) {
    b.ir.append(bpf::mov_reg(dst, Reg::FP));
    b.ir.append(bpf::alu64_imm(AluOp::Add, dst, off));
}

/// Store the 32-bit map key `idx` at `%fp + off` and point `r2` at it.
fn stack_key(b: &mut Builder, off: i16, idx: i32) {
    b.ir.append(bpf::store_imm(Size::W, Reg::FP, off, idx));
    fp_addr(b, Reg::R2, i32::from(off));
}

/// Load a link-time constant into `dst`.
fn const_imm(b: &mut Builder, dst: Reg, c: LinkConst) {
    b.ir.append_xref(bpf::mov_imm(dst, 0), ExternRef::Const(c));
}

/// `call map_lookup_elem` against `map` with the 32-bit key `idx`
/// staged on the stack at `off`.
fn lookup_slot(b: &mut Builder, map: MapRef, off: i16, idx: i32) {
    b.ir.append(bpf::store_imm(Size::W, Reg::FP, off, idx));
    map_arg(b, map);
    fp_addr(b, Reg::R2, i32::from(off));
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
}

/// Atomically add 1 to the 32-bit counter `r0` points at; `r0` must be
/// non-null.
fn bump32(b: &mut Builder) {
    b.ir.append(bpf::mov_imm(Reg::R1, 1));
    b.ir.append(bpf::xadd(Size::W, Reg::R0, 0, Reg::R1));
}

// --- routine bodies ------------------------------------------------------

fn build(sym: DlibSym) -> Difo {
    let mut b = Builder::new();
    match sym {
        DlibSym::TlsKey => tls_key(&mut b),
        DlibSym::DvarDrop => dvar_drop(&mut b),
        DlibSym::DvarLookup => dvar_lookup(&mut b),
        DlibSym::AssocLookup => assoc_lookup(&mut b),
        DlibSym::GvarGet => gvar_get(&mut b),
        DlibSym::GvarSet => gvar_set(&mut b),
        DlibSym::TvarGet => tvar_get(&mut b),
        DlibSym::TvarSet => tvar_set(&mut b),
        DlibSym::AggLookup => agg_lookup(&mut b),
        DlibSym::AggQBin => agg_qbin(&mut b),
        DlibSym::AggLQBin => agg_lqbin(&mut b),
        DlibSym::AggLLQBin => agg_llqbin(&mut b),
        DlibSym::SpecReserve => spec_reserve(&mut b),
        DlibSym::SpecMarkDrain => spec_mark_drain(&mut b),
        DlibSym::SpecNoteWrite => spec_note_write(&mut b),
        DlibSym::ProbeError => probe_error(&mut b),
        DlibSym::MemcpySmall => memcpy_small(&mut b),
        DlibSym::Strnlen => strnlen(&mut b),
    }
    // Library routines are hand-scheduled; assembly cannot fail unless
    // a body above is malformed.
    b.finish().expect("support routine failed to assemble")
}

/// Compute the dynamic-variable key for a thread-local scalar.
///
/// The key is `((tag & 0x7fffffff) << 32) | id`, where the tag is the
/// current task id plus the CPU count, or the current CPU id when the
/// task id is 0 (idle context), plus one so the tag is never zero.
fn tls_key(b: &mut Builder) {
    let zero_tid = b.ir.label();
    let join = b.ir.label();

    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R1));
    b.ir.append(bpf::call_helper(Helper::GetCurrentPidTgid));
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R0));
    b.ir.append(bpf::alu64_imm(AluOp::Lsh, Reg::R7, 32));
    b.ir.append(bpf::alu64_imm(AluOp::Rsh, Reg::R7, 32));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R7, 0, 0), zero_tid);
    const_imm(b, Reg::R8, LinkConst::Ncpus);
    b.ir.append(bpf::alu64_reg(AluOp::Add, Reg::R7, Reg::R8));
    b.ir.append_branch(bpf::jump(0), join);

    b.ir.bind(zero_tid).unwrap();
    b.ir.append(bpf::call_helper(Helper::GetSmpProcessorId));
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R0));

    b.ir.bind(join).unwrap();
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R7, 1));
    // (tag & 0x7fffffff) << 32 without a 64-bit mask constant.
    b.ir.append(bpf::alu64_imm(AluOp::Lsh, Reg::R7, 33));
    b.ir.append(bpf::alu64_imm(AluOp::Rsh, Reg::R7, 1));
    b.ir.append(bpf::alu64_reg(AluOp::Or, Reg::R7, Reg::R6));
    b.ir.append(bpf::mov_reg(Reg::R0, Reg::R7));
    b.ir.append(bpf::exit());
}

/// Count a dynamic-variable drop and return the null value.
fn dvar_drop(b: &mut Builder) {
    let out = b.ir.label();

    lookup_slot(b, MapRef::State, -4, state::DYNVAR_DROPS);
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), out);
    bump32(b);

    b.ir.bind(out).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());
}

/// Core dynamic-variable access: load, store, create, or delete the
/// variable named by a 64-bit key.
///
/// Storing the zero value deletes the entry; reading an absent entry
/// returns null without mutating anything; creating uses the caller's
/// zero-filled default block.
fn dvar_lookup(b: &mut Builder) {
    let do_lookup = b.ir.label();
    let miss = b.ir.label();
    let create = b.ir.label();
    let drop_ = b.ir.label();

    b.ir.append(bpf::store(Size::DW, Reg::FP, -8, Reg::R1));
    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R2)); // store flag
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R3)); // new value
    b.ir.append(bpf::mov_reg(Reg::R8, Reg::R4)); // default block

    // store of zero = delete
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R6, 0, 0), do_lookup);
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R7, 0, 0), do_lookup);
    map_arg(b, MapRef::Dvars);
    fp_addr(b, Reg::R2, -8);
    b.ir.append(bpf::call_helper(Helper::MapDeleteElem));
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(do_lookup).unwrap();
    map_arg(b, MapRef::Dvars);
    fp_addr(b, Reg::R2, -8);
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), miss);
    b.ir.append(bpf::exit()); // hit: r0 is the value pointer

    b.ir.bind(miss).unwrap();
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R6, 0, 0), create);
    b.ir.append(bpf::mov_imm(Reg::R0, 0)); // plain read of absent var
    b.ir.append(bpf::exit());

    b.ir.bind(create).unwrap();
    map_arg(b, MapRef::Dvars);
    fp_addr(b, Reg::R2, -8);
    b.ir.append(bpf::mov_reg(Reg::R3, Reg::R8));
    b.ir.append(bpf::mov_imm(Reg::R4, flag::ANY));
    b.ir.append(bpf::call_helper(Helper::MapUpdateElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jslt, Reg::R0, 0, 0), drop_);
    map_arg(b, MapRef::Dvars);
    fp_addr(b, Reg::R2, -8);
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), drop_);
    b.ir.append(bpf::exit());

    b.ir.bind(drop_).unwrap();
    b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::DvarDrop.sym()));
    b.ir.append(bpf::exit());
}

/// Associative-array element access: resolve the key tuple to a dvar
/// handle, creating the tuple entry at most once, then defer to
/// [`dvar_lookup`].
fn assoc_lookup(b: &mut Builder) {
    let found = b.ir.label();
    let null = b.ir.label();
    let drop_ = b.ir.label();
    let tail = b.ir.label();
    let keep = b.ir.label();

    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R1)); // tuple pointer
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R2)); // store flag
    b.ir.append(bpf::mov_reg(Reg::R8, Reg::R3)); // new value
    b.ir.append(bpf::mov_reg(Reg::R9, Reg::R4)); // default block

    map_arg(b, MapRef::Tuples);
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R6));
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R0, 0, 0), found);

    // Absent tuple: loads and deletions are complete already.
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R7, 0, 0), null);
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R8, 0, 0), null);

    // Create the tuple entry, but only if no other CPU beat us to it.
    b.ir.append(bpf::store_imm(Size::DW, Reg::FP, -8, 0));
    map_arg(b, MapRef::Tuples);
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R6));
    fp_addr(b, Reg::R3, -8);
    b.ir.append(bpf::mov_imm(Reg::R4, flag::NOEXIST));
    b.ir.append(bpf::call_helper(Helper::MapUpdateElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jslt, Reg::R0, 0, 0), drop_);
    map_arg(b, MapRef::Tuples);
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R6));
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), drop_);
    // The handle is the address of the tuple's value slot; make it
    // durable by storing it into the slot itself.
    b.ir.append(bpf::store(Size::DW, Reg::R0, 0, Reg::R0));
    b.ir.append(bpf::mov_reg(Reg::R1, Reg::R0));
    b.ir.append_branch(bpf::jump(0), tail);

    b.ir.bind(found).unwrap();
    b.ir.append(bpf::load(Size::DW, Reg::R1, Reg::R0, 0));
    // Deleting the element retires the tuple entry as well.
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R7, 0, 0), tail);
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R8, 0, 0), keep);
    b.ir.append(bpf::store(Size::DW, Reg::FP, -16, Reg::R1));
    map_arg(b, MapRef::Tuples);
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R6));
    b.ir.append(bpf::call_helper(Helper::MapDeleteElem));
    b.ir.append(bpf::load(Size::DW, Reg::R1, Reg::FP, -16));
    b.ir.bind(keep).unwrap();
    b.ir.append_branch(bpf::jump(0), tail);

    b.ir.bind(tail).unwrap();
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R7));
    b.ir.append(bpf::mov_reg(Reg::R3, Reg::R8));
    b.ir.append(bpf::mov_reg(Reg::R4, Reg::R9));
    b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::DvarLookup.sym()));
    b.ir.append(bpf::exit());

    b.ir.bind(null).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(drop_).unwrap();
    b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::DvarDrop.sym()));
    b.ir.append(bpf::exit());
}

/// Read a global variable; absent reads yield 0.
fn gvar_get(b: &mut Builder) {
    let zero = b.ir.label();

    b.ir.append(bpf::store(Size::W, Reg::FP, -4, Reg::R1));
    map_arg(b, MapRef::Gvars);
    fp_addr(b, Reg::R2, -4);
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), zero);
    b.ir.append(bpf::load(Size::DW, Reg::R0, Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(zero).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());
}

/// Write a global variable.
fn gvar_set(b: &mut Builder) {
    b.ir.append(bpf::store(Size::W, Reg::FP, -4, Reg::R1));
    b.ir.append(bpf::store(Size::DW, Reg::FP, -16, Reg::R2));
    map_arg(b, MapRef::Gvars);
    fp_addr(b, Reg::R2, -4);
    fp_addr(b, Reg::R3, -16);
    b.ir.append(bpf::mov_imm(Reg::R4, flag::ANY));
    b.ir.append(bpf::call_helper(Helper::MapUpdateElem));
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());
}

/// Read a thread-local variable; absent reads yield 0.
fn tvar_get(b: &mut Builder) {
    let zero = b.ir.label();

    b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::TlsKey.sym()));
    b.ir.append(bpf::mov_reg(Reg::R1, Reg::R0));
    b.ir.append(bpf::mov_imm(Reg::R2, 0));
    b.ir.append(bpf::mov_imm(Reg::R3, 0));
    b.ir.append(bpf::mov_imm(Reg::R4, 0));
    b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::DvarLookup.sym()));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), zero);
    b.ir.append(bpf::load(Size::DW, Reg::R0, Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(zero).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());
}

/// Write a thread-local variable; writing 0 deletes it.
fn tvar_set(b: &mut Builder) {
    let done = b.ir.label();

    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R2));
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R3));
    b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::TlsKey.sym()));
    b.ir.append(bpf::mov_reg(Reg::R1, Reg::R0));
    b.ir.append(bpf::mov_imm(Reg::R2, 1));
    b.ir.append(bpf::mov_reg(Reg::R3, Reg::R6));
    b.ir.append(bpf::mov_reg(Reg::R4, Reg::R7));
    b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::DvarLookup.sym()));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), done);
    b.ir.append(bpf::store(Size::DW, Reg::R0, 0, Reg::R6));

    b.ir.bind(done).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());
}

/// Locate (or initialize) the aggregation record for `(id, key)` and
/// return a pointer to its count field.
///
/// A record whose stored generation is older than the aggregation's
/// current generation counts as uninitialized and is reseeded, which is
/// how `clear()` avoids walking storage.
fn agg_lookup(b: &mut Builder) {
    let init = b.ir.label();
    let ok = b.ir.label();
    let set_gen = b.ir.label();
    let drop_ = b.ir.label();
    let null = b.ir.label();

    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R2)); // key pointer
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R3)); // extremum seed
    b.ir.append(bpf::mov_reg(Reg::R8, Reg::R4)); // default block

    // The aggregation id leads the key tuple.
    b.ir.append(bpf::store(Size::W, Reg::R6, 0, Reg::R1));

    // Current generation.
    b.ir.append(bpf::store(Size::W, Reg::FP, -4, Reg::R1));
    map_arg(b, MapRef::AggGen);
    fp_addr(b, Reg::R2, -4);
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), drop_);
    b.ir.append(bpf::load(Size::DW, Reg::R9, Reg::R0, 0));

    // The record itself.
    map_arg(b, MapRef::Aggs);
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R6));
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), init);
    b.ir.append(bpf::load(Size::DW, Reg::R1, Reg::R0, 0));
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jsge, Reg::R1, Reg::R9, 0), ok);

    // Missing or stale: reseed from the zero-filled default.
    b.ir.bind(init).unwrap();
    map_arg(b, MapRef::Aggs);
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R6));
    b.ir.append(bpf::mov_reg(Reg::R3, Reg::R8));
    b.ir.append(bpf::mov_imm(Reg::R4, flag::ANY));
    b.ir.append(bpf::call_helper(Helper::MapUpdateElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jslt, Reg::R0, 0, 0), drop_);
    map_arg(b, MapRef::Aggs);
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R6));
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), drop_);
    // Seed the extremum identity, if there is one.
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R7, 0, 0), set_gen);
    b.ir.append(bpf::store(Size::DW, Reg::R0, 16, Reg::R7));
    b.ir.bind(set_gen).unwrap();
    b.ir.append(bpf::store(Size::DW, Reg::R0, 0, Reg::R9));

    b.ir.bind(ok).unwrap();
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R0, 8));
    b.ir.append(bpf::exit());

    b.ir.bind(drop_).unwrap();
    lookup_slot(b, MapRef::State, -8, state::AGG_DROPS);
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), null);
    bump32(b);
    b.ir.bind(null).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());
}

/// Power-of-two bucket index: 63 for 0, 0 for the most negative value,
/// symmetric around zero, 126 buckets total plus the center.
fn agg_qbin(b: &mut Builder) {
    let nonzero = b.ir.label();
    let not_min = b.ir.label();
    let positive = b.ir.label();
    let pos_off = b.ir.label();

    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R1, 0, 0), nonzero);
    b.ir.append(bpf::mov_imm(Reg::R0, 63));
    b.ir.append(bpf::exit());

    b.ir.bind(nonzero).unwrap();
    b.ir.append_wide(bpf::lddw(Reg::R2, 0x8000_0000_0000_0000));
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jne, Reg::R1, Reg::R2, 0), not_min);
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(not_min).unwrap();
    b.ir.append(bpf::mov_reg(Reg::R3, Reg::R1));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jsge, Reg::R1, 0, 0), positive);
    b.ir.append(bpf::neg_reg(Reg::R3));
    b.ir.bind(positive).unwrap();

    // Binary search for the most significant set bit. The wide masks
    // do not fit the 32-bit immediate, so they go through a register.
    b.ir.append(bpf::mov_imm(Reg::R0, 1));

    let skip32 = b.ir.label();
    b.ir.append_wide(bpf::lddw(Reg::R4, 0x7fff_ffff_0000_0000));
    b.ir.append(bpf::mov_reg(Reg::R5, Reg::R3));
    b.ir.append(bpf::alu64_reg(AluOp::And, Reg::R5, Reg::R4));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R5, 0, 0), skip32);
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R0, 32));
    b.ir.append(bpf::alu64_imm(AluOp::Rsh, Reg::R3, 32));
    b.ir.bind(skip32).unwrap();

    let skip16 = b.ir.label();
    b.ir.append_wide(bpf::lddw(Reg::R4, 0xffff_0000));
    b.ir.append(bpf::mov_reg(Reg::R5, Reg::R3));
    b.ir.append(bpf::alu64_reg(AluOp::And, Reg::R5, Reg::R4));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R5, 0, 0), skip16);
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R0, 16));
    b.ir.append(bpf::alu64_imm(AluOp::Rsh, Reg::R3, 16));
    b.ir.bind(skip16).unwrap();

    for (mask, step) in [(0xff00, 8), (0xf0, 4), (0xc, 2), (0x2, 1)] {
        let skip = b.ir.label();
        b.ir.append(bpf::mov_reg(Reg::R5, Reg::R3));
        b.ir.append(bpf::alu64_imm(AluOp::And, Reg::R5, mask));
        b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R5, 0, 0), skip);
        b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R0, step));
        if step > 1 {
            b.ir.append(bpf::alu64_imm(AluOp::Rsh, Reg::R3, step));
        }
        b.ir.bind(skip).unwrap();
    }

    b.ir.append_branch(bpf::branch_imm(JmpOp::Jsge, Reg::R1, 0, 0), pos_off);
    b.ir.append(bpf::neg_reg(Reg::R0));
    b.ir.bind(pos_off).unwrap();
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R0, 63));
    b.ir.append(bpf::exit());
}

/// Linear bucket index: 0 below the base, capped at `levels`, result
/// shifted by one for the under-range bucket.
fn agg_lqbin(b: &mut Builder) {
    let stepped = b.ir.label();
    let based = b.ir.label();
    let capped = b.ir.label();

    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R4, 0, 0), stepped);
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(stepped).unwrap();
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jsge, Reg::R1, Reg::R2, 0), based);
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(based).unwrap();
    b.ir.append(bpf::mov_reg(Reg::R0, Reg::R1));
    b.ir.append(bpf::alu64_reg(AluOp::Sub, Reg::R0, Reg::R2));
    b.ir.append(bpf::alu64_reg(AluOp::Div, Reg::R0, Reg::R4));
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jle, Reg::R0, Reg::R3, 0), capped);
    b.ir.append(bpf::mov_reg(Reg::R0, Reg::R3));
    b.ir.bind(capped).unwrap();
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R0, 1));
    b.ir.append(bpf::exit());
}

/// Log-linear bucket index: magnitudes `factor^low ..= factor^high`,
/// each split into `nsteps` linear steps with the steps below the
/// magnitude start folded away; bucket 0 is under-range and the last
/// bucket is over-range.
fn agg_llqbin(b: &mut Builder) {
    let nonneg = b.ir.label();
    let pow = b.ir.label();
    let pow_done = b.ir.label();
    let scan = b.ir.label();
    let loop_top = b.ir.label();
    let next = b.ir.label();
    let div_ok = b.ir.label();
    let floor = b.ir.label();
    let over = b.ir.label();

    // r1=value r2=factor r3=low r4=high r5=nsteps
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jsge, Reg::R1, 0, 0), nonneg);
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(nonneg).unwrap();
    // skip = nsteps / factor, per_mag = nsteps - skip
    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R5));
    b.ir.append(bpf::alu64_reg(AluOp::Div, Reg::R6, Reg::R2));
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R5));
    b.ir.append(bpf::alu64_reg(AluOp::Sub, Reg::R7, Reg::R6));
    // magnitude count, doubling as the loop countdown
    b.ir.append(bpf::mov_reg(Reg::R8, Reg::R4));
    b.ir.append(bpf::alu64_reg(AluOp::Sub, Reg::R8, Reg::R3));
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R8, 1));
    // over-range bucket index
    b.ir.append(bpf::mov_reg(Reg::R9, Reg::R8));
    b.ir.append(bpf::alu64_reg(AluOp::Mul, Reg::R9, Reg::R7));
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R9, 1));

    // mag_end = factor^low
    b.ir.append(bpf::mov_imm(Reg::R0, 1));
    b.ir.bind(pow).unwrap();
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R3, 0, 0), pow_done);
    b.ir.append(bpf::alu64_reg(AluOp::Mul, Reg::R0, Reg::R2));
    b.ir.append(bpf::alu64_imm(AluOp::Sub, Reg::R3, 1));
    b.ir.append_branch(bpf::jump(0), pow);

    b.ir.bind(pow_done).unwrap();
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jge, Reg::R1, Reg::R0, 0), scan);
    b.ir.append(bpf::mov_imm(Reg::R0, 0)); // under-range
    b.ir.append(bpf::exit());

    b.ir.bind(scan).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R4, 0)); // magnitude index
    b.ir.bind(loop_top).unwrap();
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R8, 0, 0), over);
    b.ir.append(bpf::alu64_reg(AluOp::Mul, Reg::R0, Reg::R2));
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jge, Reg::R1, Reg::R0, 0), next);

    // In this magnitude: divide = max(mag_end / nsteps, 1)
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R0));
    b.ir.append(bpf::alu64_reg(AluOp::Div, Reg::R2, Reg::R5));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R2, 0, 0), div_ok);
    b.ir.append(bpf::mov_imm(Reg::R2, 1));
    b.ir.bind(div_ok).unwrap();
    b.ir.append(bpf::mov_reg(Reg::R0, Reg::R1));
    b.ir.append(bpf::alu64_reg(AluOp::Div, Reg::R0, Reg::R2));
    // fold away the steps below the magnitude start
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jge, Reg::R0, Reg::R6, 0), floor);
    b.ir.append(bpf::mov_reg(Reg::R0, Reg::R6));
    b.ir.bind(floor).unwrap();
    b.ir.append(bpf::alu64_reg(AluOp::Sub, Reg::R0, Reg::R6));
    b.ir.append(bpf::alu64_reg(AluOp::Mul, Reg::R4, Reg::R7));
    b.ir.append(bpf::alu64_reg(AluOp::Add, Reg::R0, Reg::R4));
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R0, 1));
    b.ir.append(bpf::exit());

    b.ir.bind(next).unwrap();
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R4, 1));
    b.ir.append(bpf::alu64_imm(AluOp::Sub, Reg::R8, 1));
    b.ir.append_branch(bpf::jump(0), loop_top);

    b.ir.bind(over).unwrap();
    b.ir.append(bpf::mov_reg(Reg::R0, Reg::R9));
    b.ir.append(bpf::exit());
}

/// Reserve a free speculation slot by create-if-absent; 0 when all
/// slots are busy.
fn spec_reserve(b: &mut Builder) {
    let loop_top = b.ir.label();
    let next = b.ir.label();
    let fail = b.ir.label();

    b.ir.append(bpf::mov_imm(Reg::R6, 1));
    const_imm(b, Reg::R7, LinkConst::Nspec);
    b.ir.append(bpf::store_imm(Size::DW, Reg::FP, -32, 0));
    b.ir.append(bpf::store_imm(Size::DW, Reg::FP, -24, 0));
    b.ir.append(bpf::store_imm(Size::DW, Reg::FP, -16, 0));

    b.ir.bind(loop_top).unwrap();
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jgt, Reg::R6, Reg::R7, 0), fail);
    b.ir.append(bpf::store(Size::W, Reg::FP, -4, Reg::R6));
    map_arg(b, MapRef::Specs);
    fp_addr(b, Reg::R2, -4);
    fp_addr(b, Reg::R3, -32);
    b.ir.append(bpf::mov_imm(Reg::R4, flag::NOEXIST));
    b.ir.append(bpf::call_helper(Helper::MapUpdateElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R0, 0, 0), next);
    b.ir.append(bpf::mov_reg(Reg::R0, Reg::R6));
    b.ir.append(bpf::exit());

    b.ir.bind(next).unwrap();
    b.ir.append(bpf::alu64_imm(AluOp::Add, Reg::R6, 1));
    b.ir.append_branch(bpf::jump(0), loop_top);

    b.ir.bind(fail).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());
}

/// Mark a speculation drainable for commit or discard. An id beyond the
/// configured range reports an invalid-operation fault.
fn spec_mark_drain(b: &mut Builder) {
    let miss = b.ir.label();
    let bad = b.ir.label();

    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R1)); // ctx
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R2)); // id
    b.ir.append(bpf::store(Size::W, Reg::FP, -4, Reg::R2));
    map_arg(b, MapRef::Specs);
    fp_addr(b, Reg::R2, -4);
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), miss);
    b.ir.append(bpf::store_imm(Size::DW, Reg::R0, 16, 1)); // draining = 1
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(miss).unwrap();
    const_imm(b, Reg::R1, LinkConst::Nspec);
    b.ir.append_branch(bpf::branch_reg(JmpOp::Jgt, Reg::R7, Reg::R1, 0), bad);
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(bad).unwrap();
    b.ir.append(bpf::mov_reg(Reg::R1, Reg::R6));
    b.ir.append(bpf::mov_imm(Reg::R2, -1));
    b.ir.append(bpf::mov_imm(Reg::R3, FaultKind::IllegalOp.code() as i32));
    b.ir.append(bpf::mov_reg(Reg::R4, Reg::R7));
    b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::ProbeError.sym()));
    b.ir.append(bpf::mov_imm(Reg::R0, -1));
    b.ir.append(bpf::exit());
}

/// Note one speculative record written into slot `id`; refused once the
/// slot is draining.
fn spec_note_write(b: &mut Builder) {
    let bad = b.ir.label();

    b.ir.append(bpf::store(Size::W, Reg::FP, -4, Reg::R1));
    map_arg(b, MapRef::Specs);
    fp_addr(b, Reg::R2, -4);
    b.ir.append(bpf::call_helper(Helper::MapLookupElem));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), bad);
    b.ir.append(bpf::load(Size::DW, Reg::R1, Reg::R0, 16));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R1, 0, 0), bad);
    b.ir.append(bpf::mov_imm(Reg::R1, 1));
    b.ir.append(bpf::xadd(Size::DW, Reg::R0, 0, Reg::R1));
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());

    b.ir.bind(bad).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, -1));
    b.ir.append(bpf::exit());
}

/// Emit an error record: reserved EPID, then six arguments (0, probe
/// id, statement id, program offset, fault kind, fault value), and bump
/// the fault counter.
fn probe_error(b: &mut Builder) {
    let out = b.ir.label();
    let counted = b.ir.label();

    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R1)); // ctx
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R2)); // pc
    b.ir.append(bpf::mov_reg(Reg::R8, Reg::R3)); // fault
    b.ir.append(bpf::mov_reg(Reg::R9, Reg::R4)); // illval

    lookup_slot(b, MapRef::Mem, -4, 0);
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), out);

    b.ir.append(bpf::store_imm(Size::W, Reg::R0, 0, ERROR_EPID as i32));
    b.ir.append(bpf::store_imm(Size::W, Reg::R0, 4, 0));
    b.ir.append(bpf::store_imm(Size::DW, Reg::R0, 8, 0));
    const_imm(b, Reg::R1, LinkConst::Prid);
    b.ir.append(bpf::store(Size::DW, Reg::R0, 16, Reg::R1));
    const_imm(b, Reg::R1, LinkConst::Stid);
    b.ir.append(bpf::store(Size::DW, Reg::R0, 24, Reg::R1));
    b.ir.append(bpf::store(Size::DW, Reg::R0, 32, Reg::R7));
    b.ir.append(bpf::store(Size::DW, Reg::R0, 40, Reg::R8));
    b.ir.append(bpf::store(Size::DW, Reg::R0, 48, Reg::R9));

    b.ir.append(bpf::mov_reg(Reg::R1, Reg::R6));
    b.ir.append_wide_xref(
        bpf::lddw_pseudo(Reg::R2, Reg::new(bpf::pseudo::MAP_FD), 0),
        ExternRef::Map(MapRef::Buffers),
    );
    b.ir.append_wide(bpf::lddw(Reg::R3, flag::CURRENT_CPU));
    b.ir.append(bpf::mov_reg(Reg::R4, Reg::R0));
    b.ir.append(bpf::mov_imm(Reg::R5, ERROR_RECORD_SIZE as i32));
    b.ir.append(bpf::call_helper(Helper::PerfEventOutput));

    lookup_slot(b, MapRef::State, -8, state::FAULTS);
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), counted);
    bump32(b);
    b.ir.bind(counted).unwrap();

    b.ir.bind(out).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, 0));
    b.ir.append(bpf::exit());
}

/// Bounded copy through the kernel read helper; the verifier enforces
/// the destination bounds.
fn memcpy_small(b: &mut Builder) {
    b.ir.append(bpf::mov_reg(Reg::R5, Reg::R2));
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R3));
    b.ir.append(bpf::mov_reg(Reg::R3, Reg::R5));
    b.ir.append(bpf::call_helper(Helper::ProbeRead));
    b.ir.append(bpf::exit());
}

/// Length of a NUL-terminated string, at most `maxlen`; -1 on fault or
/// overrun. The scratch area receives the bytes as a side effect.
fn strnlen(b: &mut Builder) {
    let err = b.ir.label();
    let ok = b.ir.label();

    b.ir.append(bpf::mov_reg(Reg::R6, Reg::R1));
    b.ir.append(bpf::mov_reg(Reg::R7, Reg::R2));
    lookup_slot(b, MapRef::Mem, -4, 0);
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), err);
    b.ir.append(bpf::mov_reg(Reg::R1, Reg::R0));
    b.ir.append(bpf::mov_reg(Reg::R2, Reg::R7));
    b.ir.append(bpf::mov_reg(Reg::R3, Reg::R6));
    b.ir.append(bpf::call_helper(Helper::ProbeReadStr));
    b.ir.append_branch(bpf::branch_imm(JmpOp::Jsgt, Reg::R0, 0, 0), ok);

    b.ir.bind(err).unwrap();
    b.ir.append(bpf::mov_imm(Reg::R0, -1));
    b.ir.append(bpf::exit());

    b.ir.bind(ok).unwrap();
    b.ir.append(bpf::alu64_imm(AluOp::Sub, Reg::R0, 1));
    b.ir.append(bpf::exit());
}
