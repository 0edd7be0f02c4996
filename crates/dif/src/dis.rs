//! Disassembler for compiled objects.
//!
//! Four listing points are available along the compile pipeline; which
//! ones are produced is selected by a bitmask option on the session.
//! Output goes through `fmt::Write` so callers decide where listings
//! land.

use bitflags::bitflags;
use core::fmt::{self, Write};

use crate::bpf::{class, mode, src, Helper, Insn, Reg, OP_CALL, OP_EXIT};
use crate::difo::Difo;
use crate::ir::ExternRef;

bitflags! {
    /// Which disassembler listings to produce.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct Listings: u8 {
        /// After compilation and assembly of a clause.
        const CLAUSE = 1;
        /// After constructing a probe program.
        const PROG = 2;
        /// After linking in the support routines.
        const LINKED = 4;
        /// After all processing, prior to loading.
        const FINAL = 8;
    }
}

const ALU_MNEMONICS: [&str; 13] = [
    "add", "sub", "mul", "div", "or", "and", "lsh", "rsh", "neg", "mod", "xor", "mov", "arsh",
];

const JMP_MNEMONICS: [&str; 14] = [
    "ja", "jeq", "jgt", "jge", "jset", "jne", "jsgt", "jsge", "call", "exit", "jlt", "jle",
    "jslt", "jsle",
];

const KNOWN_HELPERS: [Helper; 12] = [
    Helper::MapLookupElem,
    Helper::MapUpdateElem,
    Helper::MapDeleteElem,
    Helper::ProbeRead,
    Helper::KtimeGetNs,
    Helper::GetPrandomU32,
    Helper::GetSmpProcessorId,
    Helper::GetCurrentPidTgid,
    Helper::GetCurrentUidGid,
    Helper::PerfEventOutput,
    Helper::GetCurrentTask,
    Helper::ProbeReadStr,
];

fn helper_name(id: i32) -> Option<&'static str> {
    KNOWN_HELPERS
        .iter()
        .find(|h| h.id() == id)
        .map(|h| h.name())
}

fn size_suffix(code: u8) -> &'static str {
    match code & 0x18 {
        0x00 => "w",
        0x08 => "h",
        0x10 => "b",
        _ => "dw",
    }
}

fn mem_operand(base: Reg, off: i16) -> String {
    if off == 0 {
        format!("[{base}+0]")
    } else {
        format!("[{base}{off:+}]")
    }
}

fn xref_note(xref: &ExternRef) -> String {
    match xref {
        ExternRef::Sym(sym) => format!("{sym}"),
        ExternRef::Map(map) => format!("map:{map}"),
        ExternRef::Const(c) => format!("const:{}", c.name()),
        ExternRef::Str(off) => format!("str+{off}"),
    }
}

/// Render one instruction. `wide_imm` carries the combined immediate
/// when the instruction is the first slot of a double-wide load.
fn dis_insn(insn: &Insn, wide_imm: Option<u64>, note: Option<String>) -> String {
    let cls = insn.class();
    let mut text = match cls {
        class::ALU64 | class::ALU => {
            let op = (insn.code >> 4) as usize;
            let mn = ALU_MNEMONICS.get(op).copied().unwrap_or("?");
            let wide = if cls == class::ALU { "32" } else { "" };
            if mn == "neg" {
                format!("neg{wide} {}", insn.dst)
            } else if insn.code & src::X != 0 {
                format!("{mn}{wide} {}, {}", insn.dst, insn.src)
            } else {
                format!("{mn}{wide} {}, {}", insn.dst, insn.imm)
            }
        }
        class::LDX => format!(
            "ldx{} {}, {}",
            size_suffix(insn.code),
            insn.dst,
            mem_operand(insn.src, insn.off)
        ),
        class::STX => format!(
            "stx{} {}, {}",
            size_suffix(insn.code),
            mem_operand(insn.dst, insn.off),
            insn.src
        ),
        class::ST => format!(
            "st{} {}, {}",
            size_suffix(insn.code),
            mem_operand(insn.dst, insn.off),
            insn.imm
        ),
        class::LD if insn.code & 0x18 == 0x18 && insn.code & 0xe0 == mode::IMM => {
            let imm = wide_imm.unwrap_or(insn.imm as u32 as u64);
            format!("lddw {}, {imm:#x}", insn.dst)
        }
        class::JMP | class::JMP32 => {
            let opbits = insn.code & 0xf0;
            let wide = if cls == class::JMP32 { "32" } else { "" };
            if opbits == OP_CALL {
                if insn.src.num() == crate::bpf::pseudo::CALL {
                    format!("call {:+}", insn.imm)
                } else {
                    match helper_name(insn.imm) {
                        Some(name) => format!("call {name}"),
                        None => format!("call helper#{}", insn.imm),
                    }
                }
            } else if opbits == OP_EXIT {
                "exit".to_string()
            } else {
                let op = (opbits >> 4) as usize;
                let mn = JMP_MNEMONICS.get(op).copied().unwrap_or("?");
                if mn == "ja" {
                    format!("ja {:+}", insn.off)
                } else if insn.code & src::X != 0 {
                    format!("{mn}{wide} {}, {}, {:+}", insn.dst, insn.src, insn.off)
                } else {
                    format!("{mn}{wide} {}, {}, {:+}", insn.dst, insn.imm, insn.off)
                }
            }
        }
        _ => format!("raw {:#04x}", insn.code),
    };

    if let Some(note) = note {
        let pad = text.len().max(28);
        while text.len() < pad {
            text.push(' ');
        }
        text.push_str("  ! ");
        text.push_str(&note);
    }
    text
}

/// Write a listing of `difo` titled `title` to `w`.
pub fn dis_difo<W: Write>(difo: &Difo, title: &str, w: &mut W) -> fmt::Result {
    writeln!(w, "disassembly of {title}: {} insns", difo.len())?;

    let mut idx = 0u32;
    while (idx as usize) < difo.insns.len() {
        let insn = &difo.insns[idx as usize];
        let note = difo.reloc_at(idx).map(|r| xref_note(&r.target));

        let (text, slots) = if insn.is_wide() {
            let hi = difo
                .insns
                .get(idx as usize + 1)
                .map(|n| n.imm as u32 as u64)
                .unwrap_or(0);
            let imm = (hi << 32) | insn.imm as u32 as u64;
            (dis_insn(insn, Some(imm), note), 2)
        } else {
            (dis_insn(insn, None, note), 1)
        };

        writeln!(w, "{idx:05} {text}")?;
        idx += slots;
    }

    if !difo.vartab.is_empty() {
        writeln!(w, "variables:")?;
        for var in difo.vartab.iter() {
            let name = difo
                .strtab
                .get(var.name)
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .unwrap_or_default();
            writeln!(
                w,
                "  id {:#06x} {:?}/{:?} \"{}\" live {}..{}",
                var.id, var.scope, var.kind, name, var.insn_from, var.insn_to
            )?;
        }
    }
    Ok(())
}

/// Disassemble into a fresh string; convenient for logging.
pub fn dis_to_string(difo: &Difo, title: &str) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    dis_difo(difo, title, &mut out).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{self, AluOp, JmpOp};
    use crate::builder::Builder;
    use crate::difo::MapRef;

    #[test]
    fn listing_covers_the_common_shapes() {
        let mut b = Builder::new();
        let out = b.ir.label();
        b.ir.append(bpf::mov_imm(Reg::R1, 7));
        b.ir.append(bpf::alu64_reg(AluOp::Add, Reg::R1, Reg::R2));
        b.ir.append_wide_xref(
            bpf::lddw_pseudo(Reg::R2, Reg::new(bpf::pseudo::MAP_FD), 0),
            ExternRef::Map(MapRef::Strtab),
        );
        b.ir.append(bpf::load(bpf::Size::DW, Reg::R3, Reg::FP, -8));
        b.ir.append_branch(bpf::branch_imm(JmpOp::Jne, Reg::R3, 0, 0), out);
        b.ir.append(bpf::call_helper(Helper::KtimeGetNs));
        b.ir.bind(out).unwrap();
        b.ir.append(bpf::exit());

        let difo = b.finish().unwrap();
        let text = dis_to_string(&difo, "clause");

        assert!(text.contains("mov %r1, 7"));
        assert!(text.contains("add %r1, %r2"));
        assert!(text.contains("lddw %r2"));
        assert!(text.contains("map:strtab"));
        assert!(text.contains("ldxdw %r3, [%fp-8]"));
        assert!(text.contains("jne %r3, 0, +1"));
        assert!(text.contains("call ktime_get_ns"));
        assert!(text.contains("exit"));
    }
}
