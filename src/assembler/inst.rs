//! Instruction model and the static mnemonic tables.
//!
//! Instructions know their own word count and how to compile themselves;
//! the address resolver just walks the list twice. The emulated-mnemonic
//! table drives both the parser's rewrites and the disassembler's reverse
//! substitutions.

use std::collections::HashMap;

use phf::{phf_map, Map};

use super::operand::{LabelReference, Operand};
use super::source::Line;
use crate::diagnostic::Diagnostic;
use crate::spanned_error;

/// How a real mnemonic encodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstKind {
    /// Single-operand format; payload is the 3-bit opcode.
    Single(u8),
    /// Double-operand format; payload is the 4-bit opcode.
    Double(u8),
    /// Jump format; payload is the 3-bit condition.
    Jump(u8),
    Reti,
}

#[derive(Debug, Clone, Copy)]
pub struct InstInfo {
    pub kind: InstKind,
    pub byte_ok: bool,
}

const fn single(op: u8, byte_ok: bool) -> InstInfo {
    InstInfo {
        kind: InstKind::Single(op),
        byte_ok,
    }
}

const fn double(op: u8) -> InstInfo {
    InstInfo {
        kind: InstKind::Double(op),
        byte_ok: true,
    }
}

const fn jump(cond: u8) -> InstInfo {
    InstInfo {
        kind: InstKind::Jump(cond),
        byte_ok: false,
    }
}

/// Every real MSP430 mnemonic.
pub static MNEMONICS: Map<&'static str, InstInfo> = phf_map! {
    "rrc" => single(0b000, true),
    "swpb" => single(0b001, false),
    "rra" => single(0b010, true),
    "sxt" => single(0b011, false),
    "push" => single(0b100, true),
    "call" => single(0b101, false),
    "reti" => InstInfo { kind: InstKind::Reti, byte_ok: false },

    "mov" => double(0b0100),
    "add" => double(0b0101),
    "addc" => double(0b0110),
    "subc" => double(0b0111),
    "sub" => double(0b1000),
    "cmp" => double(0b1001),
    "dadd" => double(0b1010),
    "bit" => double(0b1011),
    "bic" => double(0b1100),
    "bis" => double(0b1101),
    "xor" => double(0b1110),
    "and" => double(0b1111),

    "jne" => jump(0b000),
    "jnz" => jump(0b000),
    "jeq" => jump(0b001),
    "jz" => jump(0b001),
    "jnc" => jump(0b010),
    "jlo" => jump(0b010),
    "jc" => jump(0b011),
    "jhs" => jump(0b011),
    "jn" => jump(0b100),
    "jge" => jump(0b101),
    "jl" => jump(0b110),
    "jmp" => jump(0b111),
};

/// An emulated mnemonic's rewrite into a real instruction.
///
/// `operands` are argument strings fed back through the argument scanner;
/// `{0}` stands for the user's operand.
#[derive(Debug, Clone, Copy)]
pub struct Emulated {
    pub target: &'static str,
    pub operands: &'static [&'static str],
    pub takes_arg: bool,
    pub byte_ok: bool,
}

const fn emulated(
    target: &'static str,
    operands: &'static [&'static str],
    takes_arg: bool,
    byte_ok: bool,
) -> Emulated {
    Emulated {
        target,
        operands,
        takes_arg,
        byte_ok,
    }
}

pub static EMULATED: Map<&'static str, Emulated> = phf_map! {
    "adc" => emulated("addc", &["#0", "{0}"], true, true),
    "br" => emulated("mov", &["{0}", "pc"], true, false),
    "clr" => emulated("mov", &["#0", "{0}"], true, true),
    "clrc" => emulated("bic", &["#1", "sr"], false, false),
    "clrn" => emulated("bic", &["#4", "sr"], false, false),
    "clrz" => emulated("bic", &["#2", "sr"], false, false),
    "dadc" => emulated("dadd", &["#0", "{0}"], true, true),
    "dec" => emulated("sub", &["#1", "{0}"], true, true),
    "decd" => emulated("sub", &["#2", "{0}"], true, true),
    "dint" => emulated("bic", &["#8", "sr"], false, false),
    "eint" => emulated("bis", &["#8", "sr"], false, false),
    "inc" => emulated("add", &["#1", "{0}"], true, true),
    "incd" => emulated("add", &["#2", "{0}"], true, true),
    "inv" => emulated("xor", &["#-1", "{0}"], true, true),
    "nop" => emulated("mov", &["#0", "r3"], false, false),
    "pop" => emulated("mov", &["@sp+", "{0}"], true, true),
    "ret" => emulated("mov", &["@sp+", "pc"], false, false),
    "rla" => emulated("add", &["{0}", "{0}"], true, true),
    "rlc" => emulated("addc", &["{0}", "{0}"], true, true),
    "sbc" => emulated("subc", &["#0", "{0}"], true, true),
    "setc" => emulated("bis", &["#1", "sr"], false, false),
    "setn" => emulated("bis", &["#4", "sr"], false, false),
    "setz" => emulated("bis", &["#2", "sr"], false, false),
    "tst" => emulated("cmp", &["#0", "{0}"], true, true),
    "hcf" => emulated("jmp", &["0"], false, false),
};

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Jump {
        cond: u8,
        target: LabelReference,
    },
    Single {
        mnemonic: &'static str,
        op: u8,
        byte: bool,
        src: Operand,
    },
    Double {
        op: u8,
        byte: bool,
        src: Operand,
        dst: Operand,
    },
    Reti,
    /// Zero words; forces a segment boundary.
    Padding,
    /// Zero words; listing output only.
    ListingComment(String),
    CString8(String),
    /// Zero words in the code stream; becomes a vector-table fixup.
    Interrupt {
        vector: u16,
        target: LabelReference,
    },
}

/// An instruction bound to its source line and the labels attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub inst: Instruction,
    pub origin: Line,
    pub labels: Vec<String>,
}

impl Entry {
    pub fn num_words(&self) -> u16 {
        match &self.inst {
            Instruction::Jump { .. } | Instruction::Reti => 1,
            Instruction::Single { src, .. } => 1 + src.src_ext_words(),
            Instruction::Double { src, dst, .. } => {
                1 + src.src_ext_words() + dst.dst_ext_words()
            }
            Instruction::Padding
            | Instruction::ListingComment(_)
            | Instruction::Interrupt { .. } => 0,
            // Characters plus the trailing NUL, two to a word.
            Instruction::CString8(text) => ((text.chars().count() as u16 + 1) + 1) / 2,
        }
    }

    /// Compiles to exactly `num_words()` words at `pc`.
    pub fn compile(
        &self,
        pc: u16,
        labels: &HashMap<String, u16>,
    ) -> Result<Vec<u16>, Diagnostic> {
        match &self.inst {
            Instruction::Jump { cond, target } => {
                let displacement = match target {
                    LabelReference::Label(_) => {
                        let addr = target.resolve(labels, &self.origin)?;
                        addr - pc as i32 - 2
                    }
                    // A literal target is a byte displacement from the
                    // instruction itself, not an absolute address: `jmp 0`
                    // (hcf) must loop in place at any address, which an
                    // absolute target could only encode near address 0.
                    LabelReference::Value(value) => value - 2,
                };
                if displacement % 2 != 0 {
                    return Err(spanned_error!(
                        self.origin.clone(),
                        "jump target is not word-aligned"
                    ));
                }
                let offset = displacement / 2;
                if !(-511..=512).contains(&offset) {
                    return Err(spanned_error!(
                        self.origin.clone(),
                        "jump offset {offset} out of range (-511..=512 words)"
                    ));
                }
                Ok(vec![
                    0x2000 | (*cond as u16) << 10 | (offset as u16 & 0x03FF),
                ])
            }
            Instruction::Single {
                mnemonic,
                op,
                byte,
                src,
            } => {
                if *byte && MNEMONICS.get(mnemonic).is_some_and(|info| !info.byte_ok) {
                    return Err(spanned_error!(
                        self.origin.clone(),
                        "`{mnemonic}` does not support byte mode"
                    ));
                }
                let enc = src.encode_src(*byte, pc.wrapping_add(2), labels, &self.origin)?;
                let mut words = vec![
                    0x1000
                        | (*op as u16) << 7
                        | (*byte as u16) << 6
                        | (enc.as_mode as u16) << 4
                        | enc.reg as u16,
                ];
                words.extend(enc.ext);
                Ok(words)
            }
            Instruction::Double { op, byte, src, dst } => {
                let src_enc = src.encode_src(*byte, pc.wrapping_add(2), labels, &self.origin)?;
                let dst_ext_addr = pc.wrapping_add(2 + 2 * src.src_ext_words());
                let dst_enc = dst.encode_dst(dst_ext_addr, labels, &self.origin)?;
                let mut words = vec![
                    (*op as u16) << 12
                        | (src_enc.reg as u16) << 8
                        | (dst_enc.ad as u16) << 7
                        | (*byte as u16) << 6
                        | (src_enc.as_mode as u16) << 4
                        | dst_enc.reg as u16,
                ];
                words.extend(src_enc.ext);
                words.extend(dst_enc.ext);
                Ok(words)
            }
            Instruction::Reti => Ok(vec![0x1300]),
            Instruction::Padding
            | Instruction::ListingComment(_)
            | Instruction::Interrupt { .. } => Ok(Vec::new()),
            Instruction::CString8(text) => {
                // The parser guarantees every char fits in 8 bits.
                let mut bytes: Vec<u8> = text.chars().map(|c| c as u8).collect();
                bytes.push(0);
                Ok(bytes
                    .chunks(2)
                    .map(|pair| (pair[0] as u16) << 8 | pair.get(1).copied().unwrap_or(0) as u16)
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(inst: Instruction) -> Entry {
        Entry {
            inst,
            origin: Line::new("", 1, "test"),
            labels: Vec::new(),
        }
    }

    #[test]
    fn swpb_encoding() {
        let e = entry(Instruction::Single {
            mnemonic: "swpb",
            op: 0b001,
            byte: false,
            src: Operand::RegDirect(5),
        });
        assert_eq!(e.compile(0x0010, &HashMap::new()).unwrap(), vec![0x1085]);
    }

    #[test]
    fn mov_immediate_to_sp() {
        let e = entry(Instruction::Double {
            op: 0b0100,
            byte: false,
            src: Operand::Immediate(LabelReference::Value(0x4400)),
            dst: Operand::RegDirect(1),
        });
        assert_eq!(
            e.compile(0x4400, &HashMap::new()).unwrap(),
            vec![0x4031, 0x4400]
        );
    }

    #[test]
    fn jump_literal_offset() {
        let e = entry(Instruction::Jump {
            cond: 0b111,
            target: LabelReference::Value(0x10),
        });
        assert_eq!(e.compile(0x0000, &HashMap::new()).unwrap(), vec![0x3C07]);
    }

    #[test]
    fn jump_literal_is_self_relative() {
        // The same literal target encodes identically at any address, and
        // the decoded target lands `value` bytes past the instruction.
        let e = entry(Instruction::Jump {
            cond: 0b111,
            target: LabelReference::Value(0x10),
        });
        for pc in [0x4400_u16, 0xC200] {
            let word = e.compile(pc, &HashMap::new()).unwrap()[0];
            assert_eq!(word, 0x3C07);
            let field = (word & 0x03FF) as i32;
            let offset = if field > 512 { field - 1024 } else { field };
            assert_eq!(pc as i32 + 2 * offset + 2, pc as i32 + 0x10);
        }

        // hcf's `jmp 0` rewrite loops in place regardless of address.
        let hcf = entry(Instruction::Jump {
            cond: 0b111,
            target: LabelReference::Value(0),
        });
        assert_eq!(hcf.compile(0x8000, &HashMap::new()).unwrap(), vec![0x3FFF]);
    }

    #[test]
    fn jump_label_law() {
        let mut labels = HashMap::new();
        labels.insert("fwd".to_owned(), 0x4400_u16 + 0x20);
        let e = Entry {
            inst: Instruction::Jump {
                cond: 0b111,
                target: LabelReference::Label("fwd".into()),
            },
            origin: Line::new("", 1, "jmp fwd"),
            labels: Vec::new(),
        };
        let word = e.compile(0x4400, &labels).unwrap()[0];
        let field = (word & 0x03FF) as i32;
        let offset = if field > 512 { field - 1024 } else { field };
        assert_eq!(0x4400 + 2 * offset + 2, 0x4420);
    }

    #[test]
    fn jump_out_of_range() {
        let e = entry(Instruction::Jump {
            cond: 0b111,
            target: LabelReference::Value(2048),
        });
        assert!(e.compile(0, &HashMap::new()).is_err());
    }

    #[test]
    fn byte_mode_forbidden_for_swpb() {
        let e = entry(Instruction::Single {
            mnemonic: "swpb",
            op: 0b001,
            byte: true,
            src: Operand::RegDirect(5),
        });
        assert!(e.compile(0, &HashMap::new()).is_err());
    }

    #[test]
    fn cstr8_packs_big_endian_with_nul() {
        let e = entry(Instruction::CString8("hi".into()));
        assert_eq!(e.num_words(), 2);
        assert_eq!(
            e.compile(0, &HashMap::new()).unwrap(),
            vec![(b'h' as u16) << 8 | b'i' as u16, 0x0000]
        );
    }

    #[test]
    fn word_counts() {
        assert_eq!(entry(Instruction::Reti).num_words(), 1);
        assert_eq!(entry(Instruction::Padding).num_words(), 0);
        assert_eq!(
            entry(Instruction::Interrupt {
                vector: 0xFFF8,
                target: LabelReference::Label("isr".into()),
            })
            .num_words(),
            0
        );
        assert_eq!(
            entry(Instruction::Double {
                op: 0b0100,
                byte: false,
                src: Operand::Indexed(4, LabelReference::Value(2)),
                dst: Operand::Indexed(5, LabelReference::Value(4)),
            })
            .num_words(),
            3
        );
    }
}
