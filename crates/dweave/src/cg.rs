//! The code generator: typed expression trees to DIF objects.
//!
//! One clause compiles to one object. The generated program keeps the
//! probe context in `r6` and the per-CPU record scratch in `r7` for its
//! whole run; everything else comes from the register allocator, with
//! spills landing in the reserved region of the stack frame. Variable
//! and map accesses go through the support-routine library by symbol;
//! the linker pulls the routines in.
//!
//! Bounds are always expressed as explicit compare-branch pairs with
//! the bound value materialized in a register immediately beforehand,
//! which is the shape the verifier accepts without hints.

use rustc_hash::FxHashMap;
use thiserror::Error;

use dweave_dif::bpf::{self, flag, AluOp, Helper, JmpOp, Reg, Size};
use dweave_dif::builder::Builder;
use dweave_dif::difo::{Difo, DifoFlags, LinkConst, MapRef};
use dweave_dif::ir::ExternRef;
use dweave_dif::metadesc::{AggFunc, DataDesc, FaultKind, RecDesc};
use dweave_dif::regset::{RegSet, SpillOps};
use dweave_dif::vartab::{Builtin, DifType, VarFlags, VarKind, VarScope, Variable};
use dweave_dif::{DifError, IrList, Label};
use dweave_obj::DlibSym;

use crate::ast::{Ast, BinOp, NodeId, NodeKind, UnaryOp};
use crate::stmt::{layout, Action, Clause, MAX_TRACED_STR};

/// Compile-time failures, tagged with the originating source position
/// where one is known.
#[derive(Debug, Error)]
pub enum CompileError {
    /// An assembly or allocation error at a known position.
    #[error("{pos}: {err}")]
    At {
        /// The node's source position.
        pos: String,
        /// The underlying error.
        err: DifError,
    },

    /// An assembly or allocation error with no position attached.
    #[error(transparent)]
    Dif(#[from] DifError),

    /// The construct is outside what this generator supports.
    #[error("{0}")]
    Unsupported(String),
}

/// Maximum number of key components in an associative or aggregation
/// tuple. Tuples are fixed-size on the stack: the id word, pad, then
/// this many 8-byte components, zeroed when unused so fixed-size map
/// keys compare equal.
pub const MAX_TUPLE_KEYS: usize = 4;

// Stack frame layout (offsets from the frame pointer):
// -4    scratch map key
// -96   start of the tuple area
// -200 - 8*reg   the register spill slots
const KEY_SLOT: i16 = -4;
const TUPLE_BASE: i16 = -96;
const SPILL_BASE: i32 = -200;

struct SpillToStack<'a> {
    ir: &'a mut IrList,
}

impl SpillOps for SpillToStack<'_> {
    fn spill_store(&mut self, reg: Reg) {
        let off = (SPILL_BASE - 8 * i32::from(reg.num())) as i16;
        self.ir.append(bpf::store(Size::DW, Reg::FP, off, reg));
    }

    fn spill_load(&mut self, reg: Reg) {
        let off = (SPILL_BASE - 8 * i32::from(reg.num())) as i16;
        self.ir.append(bpf::load(Size::DW, reg, Reg::FP, off));
    }
}

/// Compile `clause` against `ast`, producing the object and its record
/// layout. `aggids` maps aggregation variable ids to their assigned
/// aggregation ids.
pub fn compile(
    ast: &Ast,
    clause: &Clause,
    aggids: &FxHashMap<u32, u32>,
) -> Result<(Difo, DataDesc), CompileError> {
    let desc = layout(&clause.actions);
    let mut b = Builder::new();
    let exit_lbl = b.ir.label();
    let mut cg = CodeGen {
        ast,
        aggids,
        b,
        rs: RegSet::target(),
        exit_lbl,
    };

    cg.prologue()?;

    if let Some(pred) = clause.predicate {
        let r = cg.emit_expr(pred).map_err(|e| match e {
            CompileError::Dif(err) => CompileError::At {
                pos: ast.node(pred).pos.0.clone(),
                err,
            },
            other => other,
        })?;
        cg.b
            .ir
            .append_branch(bpf::branch_imm(JmpOp::Jeq, r, 0, 0), cg.exit_lbl);
        cg.free(r);
    }

    cg.emit_actions(&clause.actions, &desc)?;
    cg.epilogue(&desc);

    let mut difo = cg.b.finish()?;
    difo.ddesc = desc.clone();
    Ok((difo, desc))
}

struct CodeGen<'a> {
    ast: &'a Ast,
    aggids: &'a FxHashMap<u32, u32>,
    b: Builder,
    rs: RegSet,
    exit_lbl: Label,
}

impl CodeGen<'_> {
    fn alloc(&mut self) -> Result<Reg, CompileError> {
        let mut spill = SpillToStack { ir: &mut self.b.ir };
        Ok(self.rs.alloc(&mut spill)?)
    }

    fn free(&mut self, reg: Reg) {
        let mut spill = SpillToStack { ir: &mut self.b.ir };
        self.rs.free(reg, &mut spill);
    }

    fn xalloc(&mut self, reg: Reg) -> Result<(), CompileError> {
        let mut spill = SpillToStack { ir: &mut self.b.ir };
        Ok(self.rs.xalloc(reg, &mut spill)?)
    }

    fn args(&mut self) -> Result<(), CompileError> {
        let mut spill = SpillToStack { ir: &mut self.b.ir };
        Ok(self.rs.xalloc_args(&mut spill)?)
    }

    fn free_args(&mut self) {
        let mut spill = SpillToStack { ir: &mut self.b.ir };
        self.rs.free_args(&mut spill);
    }

    fn call(&mut self, sym: DlibSym) {
        self.b
            .ir
            .append_xref(bpf::call_func(-1), ExternRef::Sym(sym.sym()));
    }

    /// `dst = %fp + off`.
    fn fp_addr(&mut self, dst: Reg, off: i16) {
        self.b.ir.append(bpf::mov_reg(dst, Reg::FP));
        self.b
            .ir
            .append(bpf::alu64_imm(AluOp::Add, dst, i32::from(off)));
    }

    /// Point `dst` at the permanently-zero default block that follows
    /// the record area in the per-CPU scratch slot.
    fn dflt_addr(&mut self, dst: Reg) {
        self.b.ir.append(bpf::mov_reg(dst, Reg::R7));
        self.b
            .ir
            .append_xref(bpf::alu64_imm(AluOp::Add, dst, 0), ExternRef::Const(LinkConst::MaxRecLen));
    }

    /// Reserve the context and scratch registers and locate the
    /// per-CPU record area. A missing scratch slot abandons the
    /// firing.
    fn prologue(&mut self) -> Result<(), CompileError> {
        self.xalloc(Reg::R6)?;
        self.b.ir.append(bpf::mov_reg(Reg::R6, Reg::R1));

        self.xalloc(Reg::R7)?;
        self.args()?;
        self.b
            .ir
            .append(bpf::store_imm(Size::W, Reg::FP, KEY_SLOT, 0));
        self.b.ir.append_wide_xref(
            bpf::lddw_pseudo(Reg::R1, Reg::new(bpf::pseudo::MAP_FD), 0),
            ExternRef::Map(MapRef::Mem),
        );
        self.fp_addr(Reg::R2, KEY_SLOT);
        self.b.ir.append(bpf::call_helper(Helper::MapLookupElem));
        self.free_args();
        self.b
            .ir
            .append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), self.exit_lbl);
        self.b.ir.append(bpf::mov_reg(Reg::R7, Reg::R0));
        Ok(())
    }

    fn pos_of(&self, id: NodeId) -> String {
        self.ast.node(id).pos.0.clone()
    }

    fn note_var(&mut self, id: u32, scope: VarScope, kind: VarKind, flags: VarFlags) {
        let at = self.b.ir.len();
        self.b.vars.insert(Variable {
            name: 0,
            id,
            kind,
            scope,
            insn_from: at,
            insn_to: at,
            flags,
            ty: DifType::i64(),
        });
    }

    /// Evaluate a node into a freshly allocated register.
    fn emit_expr(&mut self, id: NodeId) -> Result<Reg, CompileError> {
        let node = self.ast.node(id);
        match &node.kind {
            NodeKind::Int(v) => {
                let dst = self.alloc()?;
                self.emit_const(dst, *v);
                Ok(dst)
            }

            NodeKind::Str(s) => {
                let off = self.b.strtab.insert_str(s);
                self.emit_str_ptr(off)
            }

            NodeKind::Builtin(b) => self.emit_builtin(*b),

            NodeKind::Var { id: vid, scope } => {
                let (sym, scope) = match scope {
                    VarScope::Global => (DlibSym::GvarGet, VarScope::Global),
                    VarScope::Thread => (DlibSym::TvarGet, VarScope::Thread),
                    other => {
                        return Err(CompileError::Unsupported(format!(
                            "{}: scalar reference with scope {other:?}",
                            self.pos_of(id)
                        )))
                    }
                };
                self.note_var(*vid, scope, VarKind::Scalar, VarFlags::REF);
                self.args()?;
                self.b.ir.append(bpf::mov_imm(Reg::R1, *vid as i32));
                self.call(sym);
                self.free_args();
                let dst = self.alloc()?;
                self.b.ir.append(bpf::mov_reg(dst, Reg::R0));
                Ok(dst)
            }

            NodeKind::Elem { id: vid, scope, key } => {
                self.note_var(*vid, *scope, VarKind::Array, VarFlags::REF);
                self.build_tuple(*vid, *scope, key)?;
                self.args()?;
                self.fp_addr(Reg::R1, TUPLE_BASE);
                self.b.ir.append(bpf::mov_imm(Reg::R2, 0));
                self.b.ir.append(bpf::mov_imm(Reg::R3, 0));
                self.b.ir.append(bpf::mov_imm(Reg::R4, 0));
                self.call(DlibSym::AssocLookup);
                self.free_args();

                // Absent elements read as the default.
                let dst = self.alloc()?;
                let absent = self.b.ir.label();
                let done = self.b.ir.label();
                self.b
                    .ir
                    .append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), absent);
                self.b.ir.append(bpf::load(Size::DW, dst, Reg::R0, 0));
                self.b.ir.append_branch(bpf::jump(0), done);
                self.b.ir.bind(absent).map_err(CompileError::from)?;
                self.b.ir.append(bpf::mov_imm(dst, 0));
                self.b.ir.bind(done).map_err(CompileError::from)?;
                Ok(dst)
            }

            NodeKind::Unary(op, operand) => {
                let dst = self.emit_expr(*operand)?;
                match op {
                    UnaryOp::Neg => {
                        self.b.ir.append(bpf::neg_reg(dst));
                    }
                    UnaryOp::BitNot => {
                        self.b.ir.append(bpf::alu64_imm(AluOp::Xor, dst, -1));
                    }
                    UnaryOp::Not => {
                        let zero = self.b.ir.label();
                        let done = self.b.ir.label();
                        self.b
                            .ir
                            .append_branch(bpf::branch_imm(JmpOp::Jne, dst, 0, 0), zero);
                        self.b.ir.append(bpf::mov_imm(dst, 1));
                        self.b.ir.append_branch(bpf::jump(0), done);
                        self.b.ir.bind(zero).map_err(CompileError::from)?;
                        self.b.ir.append(bpf::mov_imm(dst, 0));
                        self.b.ir.bind(done).map_err(CompileError::from)?;
                    }
                }
                Ok(dst)
            }

            NodeKind::Binary(op, lhs, rhs) => self.emit_binary(*op, *lhs, *rhs),

            NodeKind::Assign(target, value) => self.emit_assign(*target, *value),
        }
    }

    fn emit_const(&mut self, dst: Reg, v: i64) {
        if i32::try_from(v).is_ok() {
            self.b.ir.append(bpf::mov_imm(dst, v as i32));
        } else {
            self.b.ir.append_wide(bpf::lddw(dst, v as u64));
        }
    }

    /// A pointer to an interned string: the base of the string-table
    /// map value plus the link-rewritten offset.
    fn emit_str_ptr(&mut self, off: u32) -> Result<Reg, CompileError> {
        self.args()?;
        self.b
            .ir
            .append(bpf::store_imm(Size::W, Reg::FP, KEY_SLOT, 0));
        self.b.ir.append_wide_xref(
            bpf::lddw_pseudo(Reg::R1, Reg::new(bpf::pseudo::MAP_FD), 0),
            ExternRef::Map(MapRef::Strtab),
        );
        self.fp_addr(Reg::R2, KEY_SLOT);
        self.b.ir.append(bpf::call_helper(Helper::MapLookupElem));
        self.free_args();
        self.b
            .ir
            .append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), self.exit_lbl);

        let dst = self.alloc()?;
        self.b.ir.append(bpf::mov_reg(dst, Reg::R0));
        self.b
            .ir
            .append_xref(bpf::alu64_imm(AluOp::Add, dst, 0), ExternRef::Str(off));
        Ok(dst)
    }

    fn emit_builtin(&mut self, b: Builtin) -> Result<Reg, CompileError> {
        // Link-time constants and context loads need no helper call.
        match b {
            Builtin::Epid | Builtin::Prid => {
                let dst = self.alloc()?;
                let c = if b == Builtin::Epid {
                    LinkConst::Epid
                } else {
                    LinkConst::Prid
                };
                self.b
                    .ir
                    .append_xref(bpf::mov_imm(dst, 0), ExternRef::Const(c));
                return Ok(dst);
            }
            Builtin::Arg(n) => {
                let dst = self.alloc()?;
                self.b
                    .ir
                    .append(bpf::load(Size::DW, dst, Reg::R6, 8 * i16::from(n)));
                return Ok(dst);
            }
            Builtin::Stackdepth => {
                // TODO: needs the stack-walk support routine.
                let dst = self.alloc()?;
                self.b.ir.append(bpf::mov_imm(dst, 0));
                return Ok(dst);
            }
            _ => {}
        }

        let helper = match b {
            Builtin::Curthread => Helper::GetCurrentTask,
            Builtin::Timestamp => Helper::KtimeGetNs,
            Builtin::Curcpu => Helper::GetSmpProcessorId,
            Builtin::Pid | Builtin::Tid => Helper::GetCurrentPidTgid,
            Builtin::Uid | Builtin::Gid => Helper::GetCurrentUidGid,
            _ => unreachable!("handled above"),
        };
        self.args()?;
        self.b.ir.append(bpf::call_helper(helper));
        self.free_args();
        let dst = self.alloc()?;
        self.b.ir.append(bpf::mov_reg(dst, Reg::R0));
        match b {
            // The pid and gid are the high word; tid and uid the low.
            Builtin::Pid | Builtin::Gid => {
                self.b.ir.append(bpf::alu64_imm(AluOp::Rsh, dst, 32));
            }
            Builtin::Tid | Builtin::Uid => {
                self.b.ir.append(bpf::alu64_imm(AluOp::Lsh, dst, 32));
                self.b.ir.append(bpf::alu64_imm(AluOp::Rsh, dst, 32));
            }
            _ => {}
        }
        Ok(dst)
    }

    fn emit_binary(&mut self, op: BinOp, lhs: NodeId, rhs: NodeId) -> Result<Reg, CompileError> {
        let dst = self.emit_expr(lhs)?;
        let rr = self.emit_expr(rhs)?;

        let alu = match op {
            BinOp::Add => Some(AluOp::Add),
            BinOp::Sub => Some(AluOp::Sub),
            BinOp::Mul => Some(AluOp::Mul),
            BinOp::And => Some(AluOp::And),
            BinOp::Or => Some(AluOp::Or),
            BinOp::Xor => Some(AluOp::Xor),
            BinOp::Shl => Some(AluOp::Lsh),
            BinOp::Shr => Some(AluOp::Rsh),
            _ => None,
        };
        if let Some(alu) = alu {
            self.b.ir.append(bpf::alu64_reg(alu, dst, rr));
            self.free(rr);
            return Ok(dst);
        }

        match op {
            BinOp::Div | BinOp::Mod => {
                // A zero divisor faults the firing instead of the VM.
                let ok = self.b.ir.label();
                self.b
                    .ir
                    .append_branch(bpf::branch_imm(JmpOp::Jne, rr, 0, 0), ok);
                self.fault(FaultKind::DivZero);
                self.b.ir.bind(ok).map_err(CompileError::from)?;
                let alu = if op == BinOp::Div { AluOp::Div } else { AluOp::Mod };
                self.b.ir.append(bpf::alu64_reg(alu, dst, rr));
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let jop = match op {
                    BinOp::Eq => JmpOp::Jeq,
                    BinOp::Ne => JmpOp::Jne,
                    BinOp::Lt => JmpOp::Jslt,
                    BinOp::Le => JmpOp::Jsle,
                    BinOp::Gt => JmpOp::Jsgt,
                    _ => JmpOp::Jsge,
                };
                let yes = self.b.ir.label();
                let done = self.b.ir.label();
                self.b
                    .ir
                    .append_branch(bpf::branch_reg(jop, dst, rr, 0), yes);
                self.b.ir.append(bpf::mov_imm(dst, 0));
                self.b.ir.append_branch(bpf::jump(0), done);
                self.b.ir.bind(yes).map_err(CompileError::from)?;
                self.b.ir.append(bpf::mov_imm(dst, 1));
                self.b.ir.bind(done).map_err(CompileError::from)?;
            }
            _ => unreachable!("ALU ops handled above"),
        }
        self.free(rr);
        Ok(dst)
    }

    fn emit_assign(&mut self, target: NodeId, value: NodeId) -> Result<Reg, CompileError> {
        let rv = self.emit_expr(value)?;
        let tnode = self.ast.node(target).kind.clone();
        match tnode {
            NodeKind::Var { id: vid, scope } => {
                let sym = match scope {
                    VarScope::Global => DlibSym::GvarSet,
                    VarScope::Thread => DlibSym::TvarSet,
                    other => {
                        return Err(CompileError::Unsupported(format!(
                            "{}: assignment to scope {other:?}",
                            self.pos_of(target)
                        )))
                    }
                };
                self.note_var(vid, scope, VarKind::Scalar, VarFlags::MOD);
                self.args()?;
                self.b.ir.append(bpf::mov_imm(Reg::R1, vid as i32));
                self.b.ir.append(bpf::mov_reg(Reg::R2, rv));
                if sym == DlibSym::TvarSet {
                    self.dflt_addr(Reg::R3);
                }
                self.call(sym);
                self.free_args();
            }
            NodeKind::Elem { id: vid, scope, key } => {
                self.note_var(vid, scope, VarKind::Array, VarFlags::MOD);
                self.build_tuple(vid, scope, &key)?;
                self.args()?;
                self.fp_addr(Reg::R1, TUPLE_BASE);
                self.b.ir.append(bpf::mov_imm(Reg::R2, 1));
                self.b.ir.append(bpf::mov_reg(Reg::R3, rv));
                self.dflt_addr(Reg::R4);
                self.call(DlibSym::AssocLookup);
                self.free_args();
                // Write through the returned slot; a null means the
                // store was a delete or a drop.
                let skip = self.b.ir.label();
                self.b
                    .ir
                    .append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), skip);
                self.b.ir.append(bpf::store(Size::DW, Reg::R0, 0, rv));
                self.b.ir.bind(skip).map_err(CompileError::from)?;
            }
            _ => {
                return Err(CompileError::Unsupported(format!(
                    "{}: assignment target must be a variable",
                    self.pos_of(target)
                )))
            }
        }
        Ok(rv)
    }

    /// Zero the tuple area and fill the key components. For
    /// thread-local arrays the task id is appended as a final implicit
    /// component.
    fn build_tuple(
        &mut self,
        _vid: u32,
        scope: VarScope,
        keys: &[NodeId],
    ) -> Result<(), CompileError> {
        let implicit = usize::from(scope == VarScope::Thread);
        if keys.len() + implicit > MAX_TUPLE_KEYS {
            return Err(CompileError::Unsupported(format!(
                "tuple has more than {MAX_TUPLE_KEYS} components"
            )));
        }

        // The callee stores the variable id in the leading word; the
        // rest must be zeroed so fixed-size map keys compare equal.
        for slot in 0..=(MAX_TUPLE_KEYS as i16) {
            self.b
                .ir
                .append(bpf::store_imm(Size::DW, Reg::FP, TUPLE_BASE + 8 * slot, 0));
        }
        for (i, &key) in keys.iter().enumerate() {
            let r = self.emit_expr(key)?;
            self.b
                .ir
                .append(bpf::store(Size::DW, Reg::FP, TUPLE_BASE + 8 + 8 * i as i16, r));
            self.free(r);
        }
        if implicit == 1 {
            self.args()?;
            self.b.ir.append(bpf::call_helper(Helper::GetCurrentPidTgid));
            self.free_args();
            let r = self.alloc()?;
            self.b.ir.append(bpf::mov_reg(r, Reg::R0));
            self.b.ir.append(bpf::alu64_imm(AluOp::Lsh, r, 32));
            self.b.ir.append(bpf::alu64_imm(AluOp::Rsh, r, 32));
            self.b.ir.append(bpf::store(
                Size::DW,
                Reg::FP,
                TUPLE_BASE + 8 + 8 * keys.len() as i16,
                r,
            ));
            self.free(r);
        }
        Ok(())
    }

    /// Report a fault and abandon the firing.
    fn fault(&mut self, kind: FaultKind) {
        // Argument registers are free here: faults are emitted between
        // expression steps.
        if self.rs.xalloc_args(&mut SpillToStack { ir: &mut self.b.ir }).is_ok() {
            let pc = self.b.ir.len() as i32;
            self.b.ir.append(bpf::mov_reg(Reg::R1, Reg::R6));
            self.b.ir.append(bpf::mov_imm(Reg::R2, pc));
            self.b.ir.append(bpf::mov_imm(Reg::R3, kind.code() as i32));
            self.b.ir.append(bpf::mov_imm(Reg::R4, 0));
            self.call(DlibSym::ProbeError);
            self.free_args();
        }
        self.b
            .ir
            .append_branch(bpf::jump(0), self.exit_lbl);
    }

    fn emit_actions(
        &mut self,
        actions: &[Action],
        desc: &DataDesc,
    ) -> Result<(), CompileError> {
        // Tag the record before the fields so a partially-filled
        // record is still decodable.
        let tag = self.alloc()?;
        self.b
            .ir
            .append_xref(bpf::mov_imm(tag, 0), ExternRef::Const(LinkConst::Epid));
        self.b.ir.append(bpf::store(Size::W, Reg::R7, 0, tag));
        self.free(tag);
        self.b.ir.append(bpf::store_imm(Size::W, Reg::R7, 4, 0));

        let mut recs = desc.recs.iter();
        for action in actions {
            match action {
                Action::Expr(e) => {
                    let r = self.emit_expr(*e)?;
                    self.free(r);
                }
                Action::Trace(e) | Action::Exit(e) => {
                    let rec = recs.next().expect("layout covers every action");
                    let r = self.emit_expr(*e)?;
                    self.b
                        .ir
                        .append(bpf::store(Size::DW, Reg::R7, rec.offset as i16, r));
                    self.free(r);
                }
                Action::TraceString(e) => {
                    let rec = recs.next().expect("layout covers every action");
                    self.emit_trace_string(*e, rec)?;
                }
                Action::Speculate(e) => {
                    let rec = recs.next().expect("layout covers every action");
                    let r = self.emit_expr(*e)?;
                    self.args()?;
                    self.b.ir.append(bpf::mov_reg(Reg::R1, r));
                    self.call(DlibSym::SpecNoteWrite);
                    self.free_args();
                    // A draining speculation takes no further records.
                    let tmp = self.alloc()?;
                    self.b.ir.append(bpf::mov_reg(tmp, Reg::R0));
                    self.b
                        .ir
                        .append_branch(bpf::branch_imm(JmpOp::Jslt, tmp, 0, 0), self.exit_lbl);
                    self.free(tmp);
                    self.b
                        .ir
                        .append(bpf::store(Size::DW, Reg::R7, rec.offset as i16, r));
                    self.free(r);
                    self.b.flags |= DifoFlags::SPECULATIVE;
                }
                Action::Commit(e) | Action::Discard(e) => {
                    let rec = recs.next().expect("layout covers every action");
                    let r = self.emit_expr(*e)?;
                    self.args()?;
                    self.b.ir.append(bpf::mov_reg(Reg::R1, Reg::R6));
                    self.b.ir.append(bpf::mov_reg(Reg::R2, r));
                    self.call(DlibSym::SpecMarkDrain);
                    self.free_args();
                    self.b
                        .ir
                        .append(bpf::store(Size::DW, Reg::R7, rec.offset as i16, r));
                    self.free(r);
                }
                Action::AggUpdate {
                    varid,
                    func,
                    keys,
                    value,
                } => {
                    self.emit_agg_update(*varid, *func, keys, *value)?;
                    self.b.flags |= DifoFlags::AGGREGATING;
                }
            }
        }
        Ok(())
    }

    fn emit_trace_string(&mut self, e: NodeId, rec: &RecDesc) -> Result<(), CompileError> {
        let ptr = self.emit_expr(e)?;

        self.args()?;
        self.b.ir.append(bpf::mov_reg(Reg::R1, ptr));
        self.b
            .ir
            .append(bpf::mov_imm(Reg::R2, MAX_TRACED_STR as i32 + 1));
        self.call(DlibSym::Strnlen);
        self.free_args();

        let len = self.alloc()?;
        self.b.ir.append(bpf::mov_reg(len, Reg::R0));
        // A fault reads as the empty string.
        let nonneg = self.b.ir.label();
        self.b
            .ir
            .append_branch(bpf::branch_imm(JmpOp::Jsge, len, 0, 0), nonneg);
        self.b.ir.append(bpf::mov_imm(len, 0));
        self.b.ir.bind(nonneg).map_err(CompileError::from)?;

        // Explicit bound pair: materialize the cap, compare, clamp.
        let bound = self.alloc()?;
        self.b
            .ir
            .append(bpf::mov_imm(bound, MAX_TRACED_STR as i32));
        let within = self.b.ir.label();
        self.b
            .ir
            .append_branch(bpf::branch_reg(JmpOp::Jle, len, bound, 0), within);
        self.b.ir.append(bpf::mov_reg(len, bound));
        self.b.ir.bind(within).map_err(CompileError::from)?;
        self.free(bound);

        // Single-byte varint prefix, then the bytes.
        self.b
            .ir
            .append(bpf::store(Size::B, Reg::R7, rec.offset as i16, len));
        self.args()?;
        self.b.ir.append(bpf::mov_reg(Reg::R1, Reg::R7));
        self.b
            .ir
            .append(bpf::alu64_imm(AluOp::Add, Reg::R1, rec.offset as i32 + 1));
        self.b.ir.append(bpf::mov_reg(Reg::R2, ptr));
        self.b.ir.append(bpf::mov_reg(Reg::R3, len));
        self.call(DlibSym::MemcpySmall);
        self.free_args();

        self.free(len);
        self.free(ptr);
        Ok(())
    }

    fn emit_agg_update(
        &mut self,
        varid: u32,
        func: AggFunc,
        keys: &[NodeId],
        value: Option<NodeId>,
    ) -> Result<(), CompileError> {
        let aggid = *self.aggids.get(&varid).ok_or_else(|| {
            CompileError::Unsupported(format!("aggregation variable {varid:#x} not registered"))
        })?;
        // Every function except count() reduces an observed value; the
        // action boundary is unconstrained, so the mismatch is rejected
        // here, before any code is emitted.
        if value.is_none() && !matches!(func, AggFunc::Count) {
            return Err(CompileError::Unsupported(format!(
                "{}() requires a value expression",
                func.name()
            )));
        }
        self.note_var(varid, VarScope::Global, VarKind::Array, VarFlags::MOD);

        let rv = match value {
            Some(v) => Some(self.emit_expr(v)?),
            None => None,
        };

        // For the quantizing functions the bucket index is computed
        // before the record is located.
        let bin = match (func, rv) {
            (AggFunc::Quantize, Some(rv)) => {
                self.args()?;
                self.b.ir.append(bpf::mov_reg(Reg::R1, rv));
                self.call(DlibSym::AggQBin);
                self.free_args();
                let bin = self.alloc()?;
                self.b.ir.append(bpf::mov_reg(bin, Reg::R0));
                Some(bin)
            }
            (AggFunc::Lquantize { base, levels, step }, Some(rv)) => {
                self.args()?;
                self.b.ir.append(bpf::mov_reg(Reg::R1, rv));
                self.b.ir.append(bpf::mov_imm(Reg::R2, base));
                self.b.ir.append(bpf::mov_imm(Reg::R3, i32::from(levels)));
                self.b.ir.append(bpf::mov_imm(Reg::R4, i32::from(step)));
                self.call(DlibSym::AggLQBin);
                self.free_args();
                let bin = self.alloc()?;
                self.b.ir.append(bpf::mov_reg(bin, Reg::R0));
                Some(bin)
            }
            (
                AggFunc::Llquantize {
                    factor,
                    low,
                    high,
                    nsteps,
                },
                Some(rv),
            ) => {
                self.args()?;
                self.b.ir.append(bpf::mov_reg(Reg::R1, rv));
                self.b.ir.append(bpf::mov_imm(Reg::R2, i32::from(factor)));
                self.b.ir.append(bpf::mov_imm(Reg::R3, i32::from(low)));
                self.b.ir.append(bpf::mov_imm(Reg::R4, i32::from(high)));
                self.b.ir.append(bpf::mov_imm(Reg::R5, i32::from(nsteps)));
                self.call(DlibSym::AggLLQBin);
                self.free_args();
                let bin = self.alloc()?;
                self.b.ir.append(bpf::mov_reg(bin, Reg::R0));
                Some(bin)
            }
            _ => None,
        };

        self.build_tuple(varid, VarScope::Global, keys)?;
        self.args()?;
        self.b.ir.append(bpf::mov_imm(Reg::R1, aggid as i32));
        self.fp_addr(Reg::R2, TUPLE_BASE);
        match func.identity() {
            0 => {
                self.b.ir.append(bpf::mov_imm(Reg::R3, 0));
            }
            ident => {
                self.b.ir.append_wide(bpf::lddw(Reg::R3, ident as u64));
            }
        }
        self.dflt_addr(Reg::R4);
        self.call(DlibSym::AggLookup);
        self.free_args();

        // Null means the aggregation drop was already counted.
        let skip = self.b.ir.label();
        self.b
            .ir
            .append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), skip);

        let one = self.alloc()?;
        self.b.ir.append(bpf::mov_imm(one, 1));
        self.b.ir.append(bpf::xadd(Size::DW, Reg::R0, 0, one));

        match (func, rv) {
            (AggFunc::Count, _) => {}
            (AggFunc::Sum | AggFunc::Avg, Some(rv)) => {
                self.b.ir.append(bpf::xadd(Size::DW, Reg::R0, 8, rv));
            }
            (AggFunc::Min | AggFunc::Max, Some(rv)) => {
                let cur = self.alloc()?;
                self.b.ir.append(bpf::load(Size::DW, cur, Reg::R0, 8));
                let keep = self.b.ir.label();
                let jop = if matches!(func, AggFunc::Min) {
                    JmpOp::Jsle
                } else {
                    JmpOp::Jsge
                };
                self.b
                    .ir
                    .append_branch(bpf::branch_reg(jop, cur, rv, 0), keep);
                self.b.ir.append(bpf::store(Size::DW, Reg::R0, 8, rv));
                self.b.ir.bind(keep).map_err(CompileError::from)?;
                self.free(cur);
            }
            (AggFunc::Stddev, Some(rv)) => {
                self.b.ir.append(bpf::xadd(Size::DW, Reg::R0, 8, rv));
                let sq = self.alloc()?;
                self.b.ir.append(bpf::mov_reg(sq, rv));
                self.b.ir.append(bpf::alu64_reg(AluOp::Mul, sq, rv));
                self.b.ir.append(bpf::xadd(Size::DW, Reg::R0, 16, sq));
                self.free(sq);
            }
            (
                AggFunc::Quantize | AggFunc::Lquantize { .. } | AggFunc::Llquantize { .. },
                Some(_),
            ) => {
                // The bucket register exists for every quantizing
                // function that carries a value.
                if let Some(bin) = bin {
                    let slot = self.alloc()?;
                    self.b.ir.append(bpf::mov_reg(slot, bin));
                    self.b.ir.append(bpf::alu64_imm(AluOp::Lsh, slot, 3));
                    self.b.ir.append(bpf::alu64_reg(AluOp::Add, slot, Reg::R0));
                    self.b.ir.append(bpf::xadd(Size::DW, slot, 8, one));
                    self.free(slot);
                }
            }
            // A value-less function other than count() was rejected
            // before any code was emitted.
            (_, None) => {}
        }
        self.free(one);
        self.b.ir.bind(skip).map_err(CompileError::from)?;

        if let Some(bin) = bin {
            self.free(bin);
        }
        if let Some(rv) = rv {
            self.free(rv);
        }
        Ok(())
    }

    /// Ship the record and fall through to the exit.
    fn epilogue(&mut self, desc: &DataDesc) {
        if !desc.recs.is_empty() {
            // The argument group cannot fail here: expressions have
            // all been released.
            let _ = self.rs.xalloc_args(&mut SpillToStack { ir: &mut self.b.ir });
            self.b.ir.append(bpf::mov_reg(Reg::R1, Reg::R6));
            self.b.ir.append_wide_xref(
                bpf::lddw_pseudo(Reg::R2, Reg::new(bpf::pseudo::MAP_FD), 0),
                ExternRef::Map(MapRef::Buffers),
            );
            self.b.ir.append_wide(bpf::lddw(Reg::R3, flag::CURRENT_CPU));
            self.b.ir.append(bpf::mov_reg(Reg::R4, Reg::R7));
            self.b.ir.append(bpf::mov_imm(Reg::R5, desc.size as i32));
            self.b.ir.append(bpf::call_helper(Helper::PerfEventOutput));
            self.free_args();
        }

        // The common exit: predicate misses, faults, and refused
        // speculations all land here.
        self.b.ir.bind(self.exit_lbl).expect("exit label bound once");
        self.b.ir.append(bpf::mov_imm(Reg::R0, 0));
        self.b.ir.append(bpf::exit());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Ast;
    use dweave_dif::metadesc::ActionKind;
    use dweave_runtime::probe::ProbeDesc;

    fn probe() -> ProbeDesc {
        ProbeDesc::new("test", "", "", "tick").unwrap()
    }

    fn compile_actions(ast: &Ast, actions: Vec<Action>) -> (Difo, DataDesc) {
        let clause = Clause {
            probe: probe(),
            predicate: None,
            actions,
        };
        compile(ast, &clause, &FxHashMap::default()).unwrap()
    }

    #[test]
    fn trace_constant_compiles() {
        let mut ast = Ast::new();
        let v = ast.int(42);
        let (difo, desc) = compile_actions(&ast, vec![Action::Trace(v)]);

        assert_eq!(desc.recs.len(), 1);
        assert_eq!(desc.recs[0].action, ActionKind::Difexpr);
        // Ends with exit; ships through the output helper.
        assert_eq!(
            difo.insns.last().unwrap().code,
            bpf::class::JMP | bpf::OP_EXIT
        );
        assert!(difo
            .insns
            .iter()
            .any(|i| i.imm == Helper::PerfEventOutput.id()
                && i.code == (bpf::class::JMP | bpf::OP_CALL)));
        // References the scratch and output maps.
        let maps: Vec<_> = difo
            .krel
            .iter()
            .filter_map(|r| match r.target {
                ExternRef::Map(m) => Some(m),
                _ => None,
            })
            .collect();
        assert!(maps.contains(&MapRef::Mem));
        assert!(maps.contains(&MapRef::Buffers));
    }

    #[test]
    fn predicate_guards_the_record() {
        let mut ast = Ast::new();
        let pid = ast.builtin(Builtin::Pid);
        let thousand = ast.int(1000);
        let pred = ast.binary(BinOp::Eq, pid, thousand);
        let v = ast.int(1);
        let clause = Clause {
            probe: probe(),
            predicate: Some(pred),
            actions: vec![Action::Trace(v)],
        };
        let (difo, _) = compile(&ast, &clause, &FxHashMap::default()).unwrap();
        // The predicate's equality test and the guard branch are
        // present.
        assert!(difo.insns.iter().filter(|i| i.is_branch()).count() >= 3);
    }

    #[test]
    fn division_emits_a_zero_check() {
        let mut ast = Ast::new();
        let a = ast.int(100);
        let b = ast.int(0);
        let q = ast.binary(BinOp::Div, a, b);
        let (difo, _) = compile_actions(&ast, vec![Action::Trace(q)]);

        // A fault call with the divide-by-zero code is reachable.
        assert!(difo
            .insns
            .iter()
            .any(|i| i.code == 0xb7 && i.imm == FaultKind::DivZero.code() as i32));
        assert!(difo
            .brel
            .iter()
            .any(|r| r.target == ExternRef::Sym(DlibSym::ProbeError.sym())));
    }

    #[test]
    fn global_assignment_calls_the_store_routine() {
        let mut ast = Ast::new();
        let var = ast.var(0x0500, VarScope::Global);
        let v = ast.int(7);
        let asg = ast.assign(var, v);
        let (difo, _) = compile_actions(&ast, vec![Action::Expr(asg)]);

        assert!(difo
            .brel
            .iter()
            .any(|r| r.target == ExternRef::Sym(DlibSym::GvarSet.sym())));
        // The variable table records the modification.
        let rec = difo
            .vartab
            .lookup(0x0500, VarScope::Global, VarKind::Scalar)
            .unwrap();
        assert!(rec.flags.contains(VarFlags::MOD));
    }

    #[test]
    fn assoc_element_builds_a_tuple() {
        let mut ast = Ast::new();
        let k = ast.builtin(Builtin::Pid);
        let elem = ast.elem(0x0501, VarScope::Global, vec![k]);
        let v = ast.int(3);
        let asg = ast.assign(elem, v);
        let (difo, _) = compile_actions(&ast, vec![Action::Expr(asg)]);

        assert!(difo
            .brel
            .iter()
            .any(|r| r.target == ExternRef::Sym(DlibSym::AssocLookup.sym())));
        // The tuple area is zeroed: five 8-byte stores.
        let zeroing = difo
            .insns
            .iter()
            .filter(|i| i.code == (bpf::class::ST | bpf::mode::MEM | Size::DW.bits()))
            .count();
        assert!(zeroing >= 5);
    }

    #[test]
    fn quantize_uses_the_bin_routine() {
        let mut ast = Ast::new();
        let v = ast.builtin(Builtin::Timestamp);
        let mut aggids = FxHashMap::default();
        aggids.insert(0x0600, 1);
        let clause = Clause {
            probe: probe(),
            predicate: None,
            actions: vec![Action::AggUpdate {
                varid: 0x0600,
                func: AggFunc::Quantize,
                keys: vec![],
                value: Some(v),
            }],
        };
        let (difo, _) = compile(&ast, &clause, &aggids).unwrap();
        for sym in [DlibSym::AggQBin, DlibSym::AggLookup] {
            assert!(difo
                .brel
                .iter()
                .any(|r| r.target == ExternRef::Sym(sym.sym())));
        }
    }

    #[test]
    fn llquantize_uses_the_log_linear_bin_routine() {
        let mut ast = Ast::new();
        let v = ast.builtin(Builtin::Timestamp);
        let mut aggids = FxHashMap::default();
        aggids.insert(0x0600, 1);
        let clause = Clause {
            probe: probe(),
            predicate: None,
            actions: vec![Action::AggUpdate {
                varid: 0x0600,
                func: AggFunc::Llquantize {
                    factor: 10,
                    low: 0,
                    high: 3,
                    nsteps: 10,
                },
                keys: vec![],
                value: Some(v),
            }],
        };
        let (difo, _) = compile(&ast, &clause, &aggids).unwrap();
        assert!(difo
            .brel
            .iter()
            .any(|r| r.target == ExternRef::Sym(DlibSym::AggLLQBin.sym())));
    }

    #[test]
    fn value_less_aggregation_is_rejected_not_a_panic() {
        // count() is the only function without a value expression; any
        // other pairing is a structured compile error.
        let mut ast = Ast::new();
        let v = ast.builtin(Builtin::Timestamp);
        let mut aggids = FxHashMap::default();
        aggids.insert(0x0600, 1);

        for func in [
            AggFunc::Sum,
            AggFunc::Avg,
            AggFunc::Min,
            AggFunc::Max,
            AggFunc::Stddev,
            AggFunc::Quantize,
            AggFunc::Lquantize {
                base: 0,
                levels: 4,
                step: 1,
            },
            AggFunc::Llquantize {
                factor: 10,
                low: 0,
                high: 2,
                nsteps: 10,
            },
        ] {
            let clause = Clause {
                probe: probe(),
                predicate: None,
                actions: vec![Action::AggUpdate {
                    varid: 0x0600,
                    func,
                    keys: vec![],
                    value: None,
                }],
            };
            assert!(
                matches!(
                    compile(&ast, &clause, &aggids),
                    Err(CompileError::Unsupported(_))
                ),
                "{}() with no value must be rejected",
                func.name()
            );
        }

        // count() accepts both shapes.
        for value in [None, Some(v)] {
            let clause = Clause {
                probe: probe(),
                predicate: None,
                actions: vec![Action::AggUpdate {
                    varid: 0x0600,
                    func: AggFunc::Count,
                    keys: vec![],
                    value,
                }],
            };
            assert!(compile(&ast, &clause, &aggids).is_ok());
        }
    }

    #[test]
    fn string_trace_bounds_the_copy() {
        let mut ast = Ast::new();
        let s = ast.str_lit("hello");
        let (difo, desc) = compile_actions(&ast, vec![Action::TraceString(s)]);

        assert_eq!(desc.recs[0].size, 1 + MAX_TRACED_STR);
        // The bound value is materialized right before its compare.
        let pos = difo
            .insns
            .iter()
            .position(|i| i.code == 0xb7 && i.imm == MAX_TRACED_STR as i32)
            .expect("bound constant");
        assert!(difo.insns[pos + 1].is_branch());
        for sym in [DlibSym::Strnlen, DlibSym::MemcpySmall] {
            assert!(difo
                .brel
                .iter()
                .any(|r| r.target == ExternRef::Sym(sym.sym())));
        }
        // The interned literal is link-rewritten.
        assert!(difo
            .urel
            .iter()
            .any(|r| matches!(r.target, ExternRef::Str(_))));
    }

    #[test]
    fn unsupported_tuple_width_is_rejected() {
        let mut ast = Ast::new();
        let ks: Vec<_> = (0..5).map(|i| ast.int(i)).collect();
        let elem = ast.elem(0x0501, VarScope::Global, ks);
        let clause = Clause {
            probe: probe(),
            predicate: None,
            actions: vec![Action::Trace(elem)],
        };
        assert!(matches!(
            compile(&ast, &clause, &FxHashMap::default()),
            Err(CompileError::Unsupported(_))
        ));
    }
}
