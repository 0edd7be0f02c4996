//! The loadable program.
//!
//! After linking, a program is a flat instruction stream whose only
//! remaining symbolic content is the map references the kernel resolves
//! at load time. The loader in the runtime crate patches those with the
//! descriptors of the session's maps and submits the result to the
//! verifier.

use core::fmt;

use dweave_dif::bpf::{Insn, INSN_SIZE};
use dweave_dif::difo::{Difo, MapRef, Reloc, SymId};
use dweave_dif::dis;
use dweave_dif::ir::ExternRef;
use dweave_dif::metadesc::DataDesc;
use dweave_dif::rodata::RoData;
use dweave_dif::strtab::StrTab;
use dweave_dif::vartab::{DifType, VarTable};

/// A linked, loadable program.
#[derive(Clone, Debug)]
pub struct Program {
    /// The instruction stream: clause body first, then the support
    /// routines.
    pub insns: Vec<Insn>,
    /// Map references, indexed against the final stream.
    pub krel: Vec<Reloc>,
    /// Length of the clause portion.
    pub main_len: u32,
    /// Layout of the linked support routines: `(symbol, base, len)`.
    pub funcs: Vec<(SymId, u32, u32)>,
}

impl Program {
    /// Number of instruction slots.
    pub fn len(&self) -> u32 {
        self.insns.len() as u32
    }

    /// A program always has at least its clause body.
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// The maps this program references.
    pub fn referenced_maps(&self) -> impl Iterator<Item = MapRef> + '_ {
        self.krel.iter().filter_map(|r| match r.target {
            ExternRef::Map(m) => Some(m),
            _ => None,
        })
    }

    /// Substitute map descriptors into the instruction stream,
    /// producing the final image for the verifier. `resolve` returns
    /// the kernel descriptor for each referenced map.
    pub fn resolve_maps<F>(&self, mut resolve: F) -> Vec<Insn>
    where
        F: FnMut(MapRef) -> i32,
    {
        let mut insns = self.insns.clone();
        for r in &self.krel {
            if let ExternRef::Map(m) = r.target {
                let at = r.insn as usize;
                insns[at].imm = resolve(m);
                // The high half of the wide load stays zero: map
                // descriptors are 32-bit values.
            }
        }
        insns
    }

    /// Encode to the 8-byte-per-slot wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.insns.len() * INSN_SIZE);
        for insn in &self.insns {
            bytes.extend_from_slice(&insn.encode());
        }
        bytes
    }

    /// Write a disassembly listing of the linked program.
    pub fn dis<W: fmt::Write>(&self, title: &str, w: &mut W) -> fmt::Result {
        // Reuse the object lister over a throwaway view of the stream.
        let view = Difo {
            insns: self.insns.clone(),
            strtab: StrTab::default(),
            rodata: RoData::new(),
            vartab: VarTable::new(),
            brel: Vec::new(),
            krel: self.krel.clone(),
            urel: Vec::new(),
            ddesc: DataDesc::default(),
            rtype: DifType::i64(),
            flags: Default::default(),
        };
        dis::dis_difo(&view, title, w)?;
        for (sym, mbase, len) in &self.funcs {
            writeln!(w, "  {sym} at {mbase} ({len} insns)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlib::{Dlib, DlibSym};
    use crate::linker::{LinkParams, Linker};
    use dweave_dif::bpf::{self, Reg};
    use dweave_dif::builder::Builder;

    fn sample_program() -> Program {
        let dlib = Dlib::standard();
        let linker = Linker::new(&dlib);
        let mut b = Builder::new();
        b.ir.append(bpf::mov_imm(Reg::R1, 1));
        b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(DlibSym::GvarGet.sym()));
        b.ir.append(bpf::exit());
        let clause = b.finish().unwrap();
        let mut strtab = StrTab::default();
        linker
            .link(
                &clause,
                &mut strtab,
                &LinkParams {
                    epid: 2,
                    prid: 1,
                    stid: 0,
                    ncpus: 4,
                    nspec: 2,
                    strtab_size: 64,
                    max_rec_len: 128,
                },
            )
            .unwrap()
    }

    #[test]
    fn map_resolution_patches_wide_loads() {
        let prog = sample_program();
        let maps: Vec<_> = prog.referenced_maps().collect();
        assert!(maps.contains(&MapRef::Gvars));

        let resolved = prog.resolve_maps(|m| match m {
            MapRef::Gvars => 33,
            _ => 99,
        });
        let patched = prog
            .krel
            .iter()
            .find(|r| matches!(r.target, ExternRef::Map(MapRef::Gvars)))
            .unwrap();
        assert_eq!(resolved[patched.insn as usize].imm, 33);
    }

    #[test]
    fn wire_encoding_is_slot_sized() {
        let prog = sample_program();
        assert_eq!(prog.to_bytes().len(), prog.insns.len() * INSN_SIZE);
    }

    #[test]
    fn listing_names_the_linked_routines() {
        let prog = sample_program();
        let mut out = String::new();
        prog.dis("final program", &mut out).unwrap();
        assert!(out.contains("final program"));
        assert!(out.contains("sym4")); // gvar_get
    }
}
