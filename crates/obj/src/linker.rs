//! Linking clause objects against the support library.
//!
//! The linker produces one flat instruction stream per clause: the
//! clause body first, then every support routine it transitively calls,
//! each exactly once, in discovery order. Three kinds of references are
//! resolved here:
//!
//! - program-relative calls become signed instruction deltas;
//! - user-relative references are patched with their final values: the
//!   link-time constants from [`LinkParams`] and string offsets
//!   rewritten into the session string table;
//! - kernel-relative map references are rebased to final instruction
//!   indices and left for the loader.

use rustc_hash::FxHashMap;

use dweave_dif::difo::{Difo, LinkConst, Reloc, SymId};
use dweave_dif::entity::EntityRef;
use dweave_dif::ir::ExternRef;
use dweave_dif::strtab::StrTab;

use crate::dlib::Dlib;
use crate::program::Program;
use crate::LinkError;

/// Values for the user-relative constants of one clause/ECB binding.
#[derive(Copy, Clone, Debug)]
pub struct LinkParams {
    /// Enabled-probe id the clause is bound to.
    pub epid: u32,
    /// Probe id the ECB is attached to.
    pub prid: u32,
    /// Statement id within the program.
    pub stid: u32,
    /// Number of possible CPUs.
    pub ncpus: u32,
    /// Configured speculation slots.
    pub nspec: u32,
    /// Final session string-table size.
    pub strtab_size: u32,
    /// Maximum record length across the session.
    pub max_rec_len: u32,
}

impl LinkParams {
    fn value(&self, c: LinkConst) -> u32 {
        match c {
            LinkConst::Epid => self.epid,
            LinkConst::Prid => self.prid,
            LinkConst::Stid => self.stid,
            LinkConst::Ncpus => self.ncpus,
            LinkConst::Nspec => self.nspec,
            LinkConst::StrtabSize => self.strtab_size,
            LinkConst::MaxRecLen => self.max_rec_len,
        }
    }
}

/// Instruction-count cap enforced before handing a program to the
/// verifier.
const INSN_CAP: usize = 1_000_000;

/// The object linker.
pub struct Linker<'a> {
    dlib: &'a Dlib,
}

impl<'a> Linker<'a> {
    /// Create a linker over the given support library.
    pub fn new(dlib: &'a Dlib) -> Self {
        Linker { dlib }
    }

    /// Link `clause` into a self-contained loadable program.
    ///
    /// String constants are re-interned into `session_strtab`; the
    /// offsets patched into the program refer to that table.
    pub fn link(
        &self,
        clause: &Difo,
        session_strtab: &mut StrTab,
        params: &LinkParams,
    ) -> Result<Program, LinkError> {
        // Transitive closure of called support routines, in discovery
        // order so layout is deterministic.
        let mut order: Vec<SymId> = Vec::new();
        let mut seen: FxHashMap<SymId, ()> = FxHashMap::default();
        let mut queue: Vec<SymId> = called_syms(clause).collect();
        while let Some(sym) = queue.pop() {
            if seen.insert(sym, ()).is_some() {
                continue;
            }
            let func = self
                .dlib
                .get(sym)
                .ok_or(LinkError::UndefinedSymbol(sym.index() as u32))?;
            order.push(sym);
            queue.extend(called_syms(&func.difo));
        }

        // Layout: clause first, then the routines.
        let mut base: FxHashMap<SymId, u32> = FxHashMap::default();
        let mut cursor = clause.len();
        for &sym in &order {
            base.insert(sym, cursor);
            cursor += self.dlib.get(sym).unwrap().difo.len();
        }
        let total = cursor as usize;
        if total > INSN_CAP {
            return Err(LinkError::ProgramTooLong {
                len: total,
                cap: INSN_CAP,
            });
        }

        let mut insns = Vec::with_capacity(total);
        let mut krel = Vec::new();
        let mut funcs = Vec::with_capacity(order.len());

        let mut emit =
            |comp: &Difo, comp_base: u32, insns: &mut Vec<_>, krel: &mut Vec<Reloc>| -> Result<(), LinkError> {
                let start = insns.len();
                insns.extend_from_slice(&comp.insns);

                for r in &comp.brel {
                    let target = match r.target {
                        ExternRef::Sym(s) => s,
                        _ => unreachable!("non-call in program relocations"),
                    };
                    let target_base =
                        *base.get(&target).ok_or(LinkError::UndefinedSymbol(
                            target.index() as u32,
                        ))?;
                    let at = start + r.insn as usize;
                    let delta = i64::from(target_base) - i64::from(comp_base + r.insn) - 1;
                    insns[at].imm = delta as i32;
                }

                for r in &comp.urel {
                    let at = start + r.insn as usize;
                    let value = match r.target {
                        ExternRef::Const(c) => params.value(c),
                        ExternRef::Str(off) => {
                            let bytes = comp
                                .strtab
                                .get(off)
                                .ok_or(LinkError::DanglingString(off))?;
                            session_strtab.insert(bytes)
                        }
                        _ => unreachable!("non-constant in user relocations"),
                    };
                    insns[at].imm = value as i32;
                    if insns[at].is_wide() {
                        insns[at + 1].imm = 0;
                    }
                }

                for r in &comp.krel {
                    krel.push(Reloc {
                        insn: comp_base + r.insn,
                        target: r.target,
                    });
                }
                Ok(())
            };

        emit(clause, 0, &mut insns, &mut krel)?;
        for &sym in &order {
            let func = self.dlib.get(sym).unwrap();
            let comp_base = base[&sym];
            emit(&func.difo, comp_base, &mut insns, &mut krel)?;
            funcs.push((sym, comp_base, func.difo.len()));
        }

        log::debug!(
            "linked program: {} clause + {} support insns, {} routines, {} map relocs",
            clause.len(),
            insns.len() - clause.len() as usize,
            funcs.len(),
            krel.len()
        );

        Ok(Program {
            insns,
            krel,
            main_len: clause.len(),
            funcs,
        })
    }
}

fn called_syms(difo: &Difo) -> impl Iterator<Item = SymId> + '_ {
    difo.brel.iter().filter_map(|r| match r.target {
        ExternRef::Sym(s) => Some(s),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlib::DlibSym;
    use dweave_dif::bpf::{self, Reg};
    use dweave_dif::builder::Builder;

    fn params() -> LinkParams {
        LinkParams {
            epid: 7,
            prid: 3,
            stid: 1,
            ncpus: 8,
            nspec: 4,
            strtab_size: 4096,
            max_rec_len: 256,
        }
    }

    fn clause_calling(sym: DlibSym) -> Difo {
        let mut b = Builder::new();
        b.ir.append(bpf::mov_imm(Reg::R1, 42));
        b.ir.append_xref(bpf::call_func(-1), ExternRef::Sym(sym.sym()));
        b.ir.append(bpf::exit());
        b.finish().unwrap()
    }

    #[test]
    fn call_resolves_to_instruction_delta() {
        let dlib = Dlib::standard();
        let linker = Linker::new(&dlib);
        let clause = clause_calling(DlibSym::GvarGet);
        let mut strtab = StrTab::default();

        let prog = linker.link(&clause, &mut strtab, &params()).unwrap();
        assert_eq!(prog.main_len, 3);
        // The call at index 1 must land on the routine base.
        let call = prog.insns[1];
        let target = 1 + 1 + call.imm as i64;
        let (_, gvar_base, _) = prog.funcs[0];
        assert_eq!(target, i64::from(gvar_base));
    }

    #[test]
    fn transitive_dependencies_are_linked_once() {
        let dlib = Dlib::standard();
        let linker = Linker::new(&dlib);
        // tvar_set calls tls_key and dvar_lookup; dvar_lookup calls
        // dvar_drop.
        let clause = clause_calling(DlibSym::TvarSet);
        let mut strtab = StrTab::default();

        let prog = linker.link(&clause, &mut strtab, &params()).unwrap();
        let syms: Vec<_> = prog.funcs.iter().map(|(s, _, _)| *s).collect();
        assert!(syms.contains(&DlibSym::TvarSet.sym()));
        assert!(syms.contains(&DlibSym::TlsKey.sym()));
        assert!(syms.contains(&DlibSym::DvarLookup.sym()));
        assert!(syms.contains(&DlibSym::DvarDrop.sym()));
        // Exactly once each.
        let mut dedup = syms.clone();
        dedup.sort_by_key(|s| s.index());
        dedup.dedup();
        assert_eq!(dedup.len(), syms.len());
    }

    #[test]
    fn constants_are_patched() {
        let dlib = Dlib::standard();
        let linker = Linker::new(&dlib);
        let clause = clause_calling(DlibSym::TvarGet);
        let mut strtab = StrTab::default();

        let prog = linker.link(&clause, &mut strtab, &params()).unwrap();
        // tls_key loads NCPUS; after linking the immediate is concrete.
        assert!(prog.insns.iter().any(|i| i.imm == 8 && i.code == 0xb7));
        // No user-relative relocations survive.
        assert!(prog.krel.iter().all(|r| matches!(r.target, ExternRef::Map(_))));
    }

    #[test]
    fn strings_merge_into_the_session_table() {
        let dlib = Dlib::standard();
        let linker = Linker::new(&dlib);

        let mut b = Builder::new();
        let off = b.strtab.insert(b"hello");
        b.ir.append_xref(bpf::mov_imm(Reg::R1, 0), ExternRef::Str(off));
        b.ir.append(bpf::exit());
        let clause = b.finish().unwrap();

        let mut session = StrTab::default();
        session.insert(b"already-there");
        let prog = linker.link(&clause, &mut session, &params()).unwrap();

        let patched = prog.insns[0].imm as u32;
        assert_eq!(session.get(patched), Some(&b"hello"[..]));
    }

    #[test]
    fn map_relocations_are_rebased() {
        let dlib = Dlib::standard();
        let linker = Linker::new(&dlib);
        let clause = clause_calling(DlibSym::GvarGet);
        let mut strtab = StrTab::default();

        let prog = linker.link(&clause, &mut strtab, &params()).unwrap();
        for r in &prog.krel {
            assert!(r.insn >= prog.main_len);
            assert!(prog.insns[r.insn as usize].is_wide());
        }
    }
}
