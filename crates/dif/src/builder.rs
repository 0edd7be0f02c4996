//! The object builder and single-pass assembler.
//!
//! A [`Builder`] owns everything a clause compile accumulates: the IR
//! list, the string/rodata/variable tables, and the record descriptor.
//! [`Builder::finish`] is the assembler: it checks label and wide-slot
//! integrity, patches branch displacements, packs external references
//! into the three relocation classes, and freezes the tables into a
//! [`Difo`].
//!
//! Resolution is a single pass. All instructions were appended in final
//! order and every label was bound by the time `finish` runs, so a
//! branch's displacement is directly computable whether the reference
//! was forward or backward.

use crate::difo::{Difo, DifoFlags, Reloc, RelocClass};
use crate::entity::EntityRef;
use crate::ir::IrList;
use crate::metadesc::DataDesc;
use crate::rodata::RoData;
use crate::strtab::StrTab;
use crate::vartab::{DifType, VarTable};
use crate::{DifError, DifResult};

/// Accumulates one clause's compilation state and assembles the final
/// object.
#[derive(Debug)]
pub struct Builder {
    /// The IR under construction.
    pub ir: IrList,
    /// String table; offsets handed out here are final within the
    /// object.
    pub strtab: StrTab,
    /// Read-only data.
    pub rodata: RoData,
    /// Referenced variables.
    pub vars: VarTable,
    /// Record descriptor under construction.
    pub ddesc: DataDesc,
    /// The object's result type.
    pub rtype: DifType,
    /// Attribute flags accumulated during generation.
    pub flags: DifoFlags,
}

impl Builder {
    /// Create a builder with empty tables and an integer result type.
    pub fn new() -> Self {
        Self {
            ir: IrList::new(),
            strtab: StrTab::default(),
            rodata: RoData::new(),
            vars: VarTable::new(),
            ddesc: DataDesc::default(),
            rtype: DifType::i64(),
            flags: DifoFlags::empty(),
        }
    }

    /// Assemble the accumulated IR into a finished object.
    pub fn finish(self) -> DifResult<Difo> {
        if let Some(label) = self.ir.first_unbound() {
            return Err(DifError::UnboundLabel(label.index() as u32));
        }

        let nodes = self.ir.nodes();
        let mut insns = Vec::with_capacity(nodes.len());
        let mut brel = Vec::new();
        let mut krel = Vec::new();
        let mut urel = Vec::new();

        let mut idx = 0;
        while idx < nodes.len() {
            let node = &nodes[idx];
            let mut insn = node.insn;

            if let Some(target) = node.target {
                // Bound labels were checked above, so the position
                // exists; only the displacement range can fail.
                let pos = self.ir.label_pos(target).unwrap();
                let disp = i64::from(pos) - idx as i64 - 1;
                insn.off = i16::try_from(disp).map_err(|_| DifError::BranchOutOfRange {
                    insn: idx as u32,
                    target: pos,
                })?;
            }

            if let Some(xref) = node.xref {
                let reloc = Reloc {
                    insn: idx as u32,
                    target: xref,
                };
                match reloc.class() {
                    RelocClass::Prog => brel.push(reloc),
                    RelocClass::Kernel => krel.push(reloc),
                    RelocClass::User => urel.push(reloc),
                }
            }

            insns.push(insn);
            idx += 1;

            // A wide immediate owns the next slot; it must exist and be
            // the zero-opcode sentinel.
            if insn.is_wide() {
                match nodes.get(idx) {
                    Some(next) if next.insn.code == 0 => {
                        insns.push(next.insn);
                        idx += 1;
                    }
                    _ => return Err(DifError::MissingWideSentinel(idx as u32 - 1)),
                }
            }
        }

        log::trace!(
            "assembled object: {} insns, {} strtab bytes, {} vars, {}/{}/{} relocs",
            insns.len(),
            self.strtab.size(),
            self.vars.len(),
            brel.len(),
            krel.len(),
            urel.len()
        );

        Ok(Difo {
            insns,
            strtab: self.strtab,
            rodata: self.rodata,
            vartab: self.vars,
            brel,
            krel,
            urel,
            ddesc: self.ddesc,
            rtype: self.rtype,
            flags: self.flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{self, JmpOp, Reg};
    use crate::difo::{LinkConst, MapRef, SymId};
    use crate::entity::EntityRef;
    use crate::ir::ExternRef;

    #[test]
    fn forward_and_backward_branches_resolve() {
        let mut b = Builder::new();
        let top = b.ir.label();
        let out = b.ir.label();

        b.ir.bind(top).unwrap();
        b.ir.append(bpf::alu64_imm(bpf::AluOp::Add, Reg::R1, -1)); // 0
        b.ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R1, 0, 0), out); // 1
        b.ir.append_branch(bpf::jump(0), top); // 2
        b.ir.bind(out).unwrap();
        b.ir.append(bpf::exit()); // 3

        let difo = b.finish().unwrap();
        assert_eq!(difo.insns[1].off, 1); // 1 -> 3
        assert_eq!(difo.insns[2].off, -3); // 2 -> 0
    }

    #[test]
    fn unbound_label_fails() {
        let mut b = Builder::new();
        let dangling = b.ir.label();
        b.ir.append_branch(bpf::jump(0), dangling);
        assert!(matches!(b.finish(), Err(DifError::UnboundLabel(0))));
    }

    #[test]
    fn wide_immediate_without_sentinel_fails() {
        let mut b = Builder::new();
        let [lo, _] = bpf::lddw(Reg::R1, 0xdead_beef);
        b.ir.append(lo);
        assert!(matches!(
            b.finish(),
            Err(DifError::MissingWideSentinel(0))
        ));
    }

    #[test]
    fn relocations_split_by_class() {
        let mut b = Builder::new();
        b.ir.append_wide_xref(
            bpf::lddw_pseudo(Reg::R1, Reg::new(bpf::pseudo::MAP_FD), 0),
            ExternRef::Map(MapRef::Gvars),
        );
        b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(SymId::new(0)));
        b.ir.append_xref(
            bpf::mov_imm(Reg::R2, 0),
            ExternRef::Const(LinkConst::Epid),
        );
        b.ir.append(bpf::exit());

        let difo = b.finish().unwrap();
        assert_eq!(difo.krel.len(), 1);
        assert_eq!(difo.brel.len(), 1);
        assert_eq!(difo.urel.len(), 1);
        assert_eq!(difo.krel[0].insn, 0);
        assert_eq!(difo.brel[0].insn, 2);
        assert_eq!(difo.urel[0].insn, 3);
    }
}
