//! The pre-assembly instruction list.
//!
//! The code generator appends instructions in final order; control flow
//! uses labels that are bound to positions as generation reaches them.
//! Because IR nodes map one-to-one onto final instructions (there is no
//! relaxation pass in this VM), a bound label's position is simply the
//! node index, and the assembler's job reduces to displacement patching
//! and range checking.

use crate::bpf::Insn;
use crate::difo::{LinkConst, MapRef, SymId};
use crate::entity_ref;
use crate::{DifError, DifResult};

/// A branch-target label.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct Label(u32);
entity_ref!(Label, "L");

/// An external reference attached to one IR node, resolved after
/// assembly by the linker or the loader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum ExternRef {
    /// Call into a named support routine; program-relative.
    Sym(SymId),
    /// A shared map descriptor; resolved by the kernel at load time.
    Map(MapRef),
    /// A link-time constant; resolved when the object is bound to its
    /// ECB.
    Const(LinkConst),
    /// An offset into the object's string table; rewritten when string
    /// tables are merged at link time.
    Str(u32),
}

/// One IR node: an instruction plus optional branch target and external
/// reference.
#[derive(Clone, Debug)]
pub struct IrNode {
    /// The instruction.
    pub insn: Insn,
    /// Branch target; the assembler patches the displacement.
    pub target: Option<Label>,
    /// External reference; the assembler packs it into a relocation.
    pub xref: Option<ExternRef>,
}

/// An append-only list of IR nodes with label management.
#[derive(Clone, Debug, Default)]
pub struct IrList {
    nodes: Vec<IrNode>,
    // Position of each label, indexed by label number; None = unbound.
    labels: Vec<Option<u32>>,
}

impl IrList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, unbound label.
    pub fn label(&mut self) -> Label {
        let l = Label(self.labels.len() as u32);
        self.labels.push(None);
        l
    }

    /// Bind `label` to the next appended instruction.
    pub fn bind(&mut self, label: Label) -> DifResult<()> {
        let slot = &mut self.labels[label.0 as usize];
        if slot.is_some() {
            return Err(DifError::RedefinedLabel(label.0));
        }
        *slot = Some(self.nodes.len() as u32);
        Ok(())
    }

    /// Append one instruction, returning its index.
    pub fn append(&mut self, insn: Insn) -> u32 {
        self.push(IrNode {
            insn,
            target: None,
            xref: None,
        })
    }

    /// Append an instruction carrying an external reference.
    pub fn append_xref(&mut self, insn: Insn, xref: ExternRef) -> u32 {
        self.push(IrNode {
            insn,
            target: None,
            xref: Some(xref),
        })
    }

    /// Append a branch whose displacement will be patched to reach
    /// `target`.
    pub fn append_branch(&mut self, insn: Insn, target: Label) -> u32 {
        debug_assert!(insn.is_branch());
        self.push(IrNode {
            insn,
            target: Some(target),
            xref: None,
        })
    }

    /// Append the two slots of a double-wide immediate load.
    pub fn append_wide(&mut self, pair: [Insn; 2]) -> u32 {
        let idx = self.append(pair[0]);
        self.append(pair[1]);
        idx
    }

    /// Append a double-wide immediate load carrying an external
    /// reference on its first slot.
    pub fn append_wide_xref(&mut self, pair: [Insn; 2], xref: ExternRef) -> u32 {
        let idx = self.append_xref(pair[0], xref);
        self.append(pair[1]);
        idx
    }

    fn push(&mut self, node: IrNode) -> u32 {
        let idx = self.nodes.len() as u32;
        self.nodes.push(node);
        idx
    }

    /// Number of instructions appended so far. Doubles as the index of
    /// the next instruction, which is how lifetime windows are recorded.
    pub fn len(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Is the list empty?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The nodes in order.
    pub fn nodes(&self) -> &[IrNode] {
        &self.nodes
    }

    /// The bound position of `label`, if any.
    pub fn label_pos(&self, label: Label) -> Option<u32> {
        self.labels[label.0 as usize]
    }

    /// The first label (by number) that is still unbound, if any.
    pub fn first_unbound(&self) -> Option<Label> {
        self.labels
            .iter()
            .position(|p| p.is_none())
            .map(|i| Label(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{self, JmpOp, Reg};

    #[test]
    fn labels_bind_to_the_next_instruction() {
        let mut ir = IrList::new();
        let top = ir.label();
        ir.append(bpf::mov_imm(Reg::R0, 0));
        ir.bind(top).unwrap();
        let at = ir.append(bpf::mov_imm(Reg::R1, 1));
        assert_eq!(ir.label_pos(top), Some(at));
    }

    #[test]
    fn rebinding_is_an_error() {
        let mut ir = IrList::new();
        let l = ir.label();
        ir.bind(l).unwrap();
        assert!(matches!(ir.bind(l), Err(DifError::RedefinedLabel(0))));
    }

    #[test]
    fn unbound_labels_are_found() {
        let mut ir = IrList::new();
        let a = ir.label();
        let b = ir.label();
        ir.bind(a).unwrap();
        assert_eq!(ir.first_unbound(), Some(b));
        ir.append_branch(bpf::branch_imm(JmpOp::Jeq, Reg::R0, 0, 0), b);
        ir.bind(b).unwrap();
        assert_eq!(ir.first_unbound(), None);
    }
}
