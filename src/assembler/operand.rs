//! Typed operands and their addressing-mode encodings.
//!
//! Operands are built during parsing but carry unresolved label references;
//! the actual field + extension-word encoding happens at compile time, once
//! the label map and the extension word's own address are known.

use std::collections::HashMap;
use std::fmt;

use super::source::Line;
use crate::diagnostic::Diagnostic;
use crate::spanned_error;

/// Immediates the constant generator can supply without an extension word,
/// as `(value, As, reg)`.
pub const CONSTANT_GENERATOR: [(i32, u8, u8); 6] = [
    (0, 0b00, 3),
    (1, 0b01, 3),
    (2, 0b10, 3),
    (4, 0b10, 2),
    (8, 0b11, 2),
    (-1, 0b11, 3),
];

/// A literal value or a label resolved against the address map at compile
/// time.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelReference {
    Value(i32),
    Label(String),
}

impl LabelReference {
    pub fn resolve(&self, labels: &HashMap<String, u16>, origin: &Line) -> Result<i32, Diagnostic> {
        match self {
            LabelReference::Value(value) => Ok(*value),
            LabelReference::Label(name) => labels
                .get(name)
                .map(|addr| *addr as i32)
                .ok_or_else(|| spanned_error!(origin.clone(), "label `{name}` not found")),
        }
    }

    fn resolve_u16(&self, labels: &HashMap<String, u16>, origin: &Line) -> Result<u16, Diagnostic> {
        let value = self.resolve(labels, origin)?;
        if !(-0x8000..=0xFFFF).contains(&value) {
            return Err(spanned_error!(origin.clone(), "value {value} does not fit in 16 bits"));
        }
        Ok(value as u16)
    }
}

impl fmt::Display for LabelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelReference::Value(value) => write!(f, "{value:#x}"),
            LabelReference::Label(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    RegDirect(u8),
    Indexed(u8, LabelReference),
    RegIndirect(u8),
    RegIndirectAuto(u8),
    Symbolic(LabelReference),
    Absolute(LabelReference),
    Immediate(LabelReference),
}

/// A fully-encoded source operand: `As`, register field, extension word.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodedSrc {
    pub as_mode: u8,
    pub reg: u8,
    pub ext: Option<u16>,
}

/// A fully-encoded destination operand: `Ad`, register field, extension
/// word.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodedDst {
    pub ad: u8,
    pub reg: u8,
    pub ext: Option<u16>,
}

impl Operand {
    /// Extension words this operand adds in source position. Deterministic
    /// at parse time: label immediates always take a word, and only literal
    /// immediates qualify for the constant generator.
    pub fn src_ext_words(&self) -> u16 {
        match self {
            Operand::RegDirect(_) | Operand::RegIndirect(_) | Operand::RegIndirectAuto(_) => 0,
            Operand::Indexed(_, _) | Operand::Symbolic(_) | Operand::Absolute(_) => 1,
            Operand::Immediate(LabelReference::Value(value)) => {
                if CONSTANT_GENERATOR.iter().any(|(v, _, _)| v == value) {
                    0
                } else {
                    1
                }
            }
            Operand::Immediate(LabelReference::Label(_)) => 1,
        }
    }

    /// Extension words in destination position. Illegal destinations report
    /// 0 here; `encode_dst` rejects them before any words are emitted.
    pub fn dst_ext_words(&self) -> u16 {
        match self {
            Operand::Indexed(_, _) | Operand::Symbolic(_) | Operand::Absolute(_) => 1,
            _ => 0,
        }
    }

    /// Encodes this operand as a source. `ext_addr` is the address the
    /// extension word will occupy, which symbolic (PC-relative) operands
    /// subtract from their target.
    pub fn encode_src(
        &self,
        byte_mode: bool,
        ext_addr: u16,
        labels: &HashMap<String, u16>,
        origin: &Line,
    ) -> Result<EncodedSrc, Diagnostic> {
        match self {
            Operand::RegDirect(reg) => Ok(EncodedSrc {
                as_mode: 0b00,
                reg: *reg,
                ext: None,
            }),
            Operand::Indexed(reg, offset) => Ok(EncodedSrc {
                as_mode: 0b01,
                reg: *reg,
                ext: Some(offset.resolve_u16(labels, origin)?),
            }),
            Operand::RegIndirect(reg) => Ok(EncodedSrc {
                as_mode: 0b10,
                reg: *reg,
                ext: None,
            }),
            Operand::RegIndirectAuto(reg) => Ok(EncodedSrc {
                as_mode: 0b11,
                reg: *reg,
                ext: None,
            }),
            Operand::Symbolic(target) => {
                let target = target.resolve_u16(labels, origin)?;
                Ok(EncodedSrc {
                    as_mode: 0b01,
                    reg: 0,
                    ext: Some(target.wrapping_sub(ext_addr)),
                })
            }
            Operand::Absolute(target) => Ok(EncodedSrc {
                as_mode: 0b01,
                reg: 2,
                ext: Some(target.resolve_u16(labels, origin)?),
            }),
            Operand::Immediate(value) => {
                if let LabelReference::Value(literal) = value {
                    if let Some((_, as_mode, reg)) =
                        CONSTANT_GENERATOR.iter().find(|(v, _, _)| v == literal)
                    {
                        return Ok(EncodedSrc {
                            as_mode: *as_mode,
                            reg: *reg,
                            ext: None,
                        });
                    }
                }
                let word = value.resolve_u16(labels, origin)?;
                // Byte immediates live in the high byte of the extension
                // word: memory is big-endian, so a byte fetch at the
                // extension word's address sees bits 8-15.
                let ext = if byte_mode { (word & 0xFF) << 8 } else { word };
                Ok(EncodedSrc {
                    as_mode: 0b11,
                    reg: 0,
                    ext: Some(ext),
                })
            }
        }
    }

    /// Encodes this operand as a destination. Only register-direct and the
    /// indexed family are legal.
    pub fn encode_dst(
        &self,
        ext_addr: u16,
        labels: &HashMap<String, u16>,
        origin: &Line,
    ) -> Result<EncodedDst, Diagnostic> {
        match self {
            Operand::RegDirect(reg) => Ok(EncodedDst {
                ad: 0,
                reg: *reg,
                ext: None,
            }),
            Operand::Indexed(reg, offset) => Ok(EncodedDst {
                ad: 1,
                reg: *reg,
                ext: Some(offset.resolve_u16(labels, origin)?),
            }),
            Operand::Symbolic(target) => {
                let target = target.resolve_u16(labels, origin)?;
                Ok(EncodedDst {
                    ad: 1,
                    reg: 0,
                    ext: Some(target.wrapping_sub(ext_addr)),
                })
            }
            Operand::Absolute(target) => Ok(EncodedDst {
                ad: 1,
                reg: 2,
                ext: Some(target.resolve_u16(labels, origin)?),
            }),
            Operand::RegIndirect(_) | Operand::RegIndirectAuto(_) | Operand::Immediate(_) => {
                Err(spanned_error!(
                    origin.clone(),
                    "illegal addressing mode for a destination"
                ))
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::RegDirect(reg) => write!(f, "r{reg}"),
            Operand::Indexed(reg, offset) => write!(f, "{offset}(r{reg})"),
            Operand::RegIndirect(reg) => write!(f, "@r{reg}"),
            Operand::RegIndirectAuto(reg) => write!(f, "@r{reg}+"),
            Operand::Symbolic(target) => write!(f, "{target}"),
            Operand::Absolute(target) => write!(f, "&{target}"),
            Operand::Immediate(value) => write!(f, "#{value}"),
        }
    }
}
