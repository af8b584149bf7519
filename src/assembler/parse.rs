//! Token-stream instruction parser.
//!
//! A read-head automaton over the lexed stream. Emulated mnemonics are
//! rewritten into real instructions here, reusing the argument scanner on
//! the rewrite pattern's literal operands. On any failure the parser records
//! a diagnostic and resynchronizes to the next line start, so one bad line
//! never hides the rest.

use std::mem;

use super::inst::{Emulated, Entry, InstKind, Instruction, EMULATED, MNEMONICS};
use super::lex::{self, Token, TokenInner, TokenStream};
use super::operand::{LabelReference, Operand};
use super::source::Line;
use super::Errors;
use crate::diagnostic::Diagnostic;
use crate::spanned_error;

struct Parser {
    stream: TokenStream,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.stream.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.stream.get(self.position).cloned();
        self.position += 1;
        token
    }

    /// Like `next`, but refuses to cross a line boundary; operand helpers
    /// use this so an error never eats the next line's `LineStart`.
    fn next_on_line(&mut self) -> Option<Token> {
        match self.peek() {
            Some(token) if token.inner == TokenInner::LineStart => None,
            _ => self.next(),
        }
    }

    /// Skips to the next `LineStart` so parsing can continue after an error.
    fn resync(&mut self) {
        while let Some(token) = self.peek() {
            if token.inner == TokenInner::LineStart {
                break;
            }
            self.position += 1;
        }
    }
}

pub fn parse(stream: TokenStream, errors: &mut Errors) -> Vec<Entry> {
    let mut parser = Parser {
        stream,
        position: 0,
    };
    let mut out: Vec<Entry> = Vec::new();
    let mut origin = Line::new("", 0, "");
    let mut pending: Vec<String> = Vec::new();
    let mut data_mode = false;

    while let Some(token) = parser.next() {
        use TokenInner as TI;
        match token.inner {
            TI::LineStart => origin = token.origin,
            TI::Label(name) => pending.push(name),
            TI::DbgBreak => out.push(Entry {
                inst: Instruction::Padding,
                origin: origin.clone(),
                labels: mem::take(&mut pending),
            }),
            TI::ListingComment(text) => out.push(Entry {
                inst: Instruction::ListingComment(text),
                origin: origin.clone(),
                labels: mem::take(&mut pending),
            }),
            TI::Interrupt(vector) => match parser.next_on_line() {
                Some(Token {
                    inner: TI::LabelVal(target),
                    ..
                }) => out.push(Entry {
                    inst: Instruction::Interrupt {
                        vector,
                        target: LabelReference::Label(target),
                    },
                    origin: origin.clone(),
                    labels: mem::take(&mut pending),
                }),
                _ => {
                    errors.push(spanned_error!(
                        origin.clone(),
                        "`.interrupt` must name a target label"
                    ));
                    parser.resync();
                }
            },
            TI::DataMode => data_mode = true,
            TI::CString8Data(text) => {
                if !data_mode {
                    errors.push(
                        spanned_error!(origin.clone(), "string data outside a data section")
                            .as_bug(),
                    );
                    parser.resync();
                    continue;
                }
                if let Some(c) = text.chars().find(|c| (*c as u32) > 0xFF) {
                    errors.push(spanned_error!(
                        origin.clone(),
                        "character `{c}` does not fit in 8 bits"
                    ));
                    parser.resync();
                    continue;
                }
                out.push(Entry {
                    inst: Instruction::CString8(text),
                    origin: origin.clone(),
                    labels: mem::take(&mut pending),
                });
            }
            TI::Mnemonic(name) => match mnemonic(&mut parser, &name, &origin) {
                Ok(inst) => out.push(Entry {
                    inst,
                    origin: origin.clone(),
                    labels: mem::take(&mut pending),
                }),
                Err(err) => {
                    errors.push(err);
                    parser.resync();
                }
            },
            other => {
                errors.push(spanned_error!(
                    origin.clone(),
                    "unexpected {}",
                    other.description()
                ));
                parser.resync();
            }
        }
    }

    out
}

fn mnemonic(parser: &mut Parser, name: &str, origin: &Line) -> Result<Instruction, Diagnostic> {
    let indicator = match parser.peek() {
        Some(Token {
            inner: TokenInner::ModeIndicator(byte),
            ..
        }) => {
            let byte = *byte;
            parser.position += 1;
            Some(byte)
        }
        _ => None,
    };

    if let Some(em) = EMULATED.get(name) {
        return emulated(parser, name, em, indicator, origin);
    }

    let Some((key, info)) = MNEMONICS.get_entry(name) else {
        return Err(spanned_error!(origin.clone(), "unknown mnemonic `{name}`"));
    };

    // An explicit `.w` is always harmless; `.b` needs support.
    if indicator == Some(true) && !info.byte_ok {
        return Err(spanned_error!(
            origin.clone(),
            "`{name}` does not support byte mode"
        ));
    }
    let byte = indicator.unwrap_or(false);

    match info.kind {
        InstKind::Jump(cond) => Ok(Instruction::Jump {
            cond,
            target: jump_target(parser, origin)?,
        }),
        InstKind::Reti => Ok(Instruction::Reti),
        InstKind::Single(op) => Ok(Instruction::Single {
            mnemonic: *key,
            op,
            byte,
            src: operand(parser, origin)?,
        }),
        InstKind::Double(op) => {
            let src = operand(parser, origin)?;
            let dst = operand(parser, origin)?;
            Ok(Instruction::Double { op, byte, src, dst })
        }
    }
}

/// Rewrites an emulated mnemonic to its real instruction, running the
/// pattern's literal operands back through the argument scanner.
fn emulated(
    parser: &mut Parser,
    name: &str,
    em: &Emulated,
    indicator: Option<bool>,
    origin: &Line,
) -> Result<Instruction, Diagnostic> {
    if indicator.is_some() && !em.byte_ok {
        return Err(spanned_error!(
            origin.clone(),
            "`{name}` does not take a mode indicator"
        ));
    }
    let byte = indicator.unwrap_or(false);

    let user = if em.takes_arg {
        Some(operand(parser, origin)?)
    } else {
        None
    };

    let info = MNEMONICS
        .get(em.target)
        .ok_or_else(|| spanned_error!(origin.clone(), "bad rewrite target `{}`", em.target).as_bug())?;

    match info.kind {
        InstKind::Jump(cond) => {
            let offset = lex::parse_int(em.operands[0]).ok_or_else(|| {
                spanned_error!(origin.clone(), "bad rewrite offset `{}`", em.operands[0]).as_bug()
            })?;
            Ok(Instruction::Jump {
                cond,
                target: LabelReference::Value(offset),
            })
        }
        InstKind::Double(op) => {
            let src = template_operand(em.operands[0], &user, origin)?;
            let dst = template_operand(em.operands[1], &user, origin)?;
            Ok(Instruction::Double { op, byte, src, dst })
        }
        InstKind::Single(_) | InstKind::Reti => Err(spanned_error!(
            origin.clone(),
            "rewrite target `{}` is not a double-operand instruction",
            em.target
        )
        .as_bug()),
    }
}

fn template_operand(
    template: &str,
    user: &Option<Operand>,
    origin: &Line,
) -> Result<Operand, Diagnostic> {
    if template == "{0}" {
        return user
            .clone()
            .ok_or_else(|| spanned_error!(origin.clone(), "rewrite pattern missing operand").as_bug());
    }

    let tokens = lex::scan_argument(template)
        .map_err(|err| spanned_error!(origin.clone(), "bad rewrite operand: {}", err.message()).as_bug())?;
    let stream = tokens
        .into_iter()
        .map(|inner| Token {
            inner,
            origin: origin.clone(),
        })
        .collect();
    let mut sub = Parser {
        stream,
        position: 0,
    };
    operand(&mut sub, origin)
}

fn jump_target(parser: &mut Parser, origin: &Line) -> Result<LabelReference, Diagnostic> {
    match parser.next_on_line() {
        Some(Token {
            inner: TokenInner::Value(offset),
            ..
        }) => Ok(LabelReference::Value(offset)),
        Some(Token {
            inner: TokenInner::LabelVal(name),
            ..
        }) => Ok(LabelReference::Label(name)),
        Some(token) => Err(spanned_error!(
            origin.clone(),
            "expected jump target, found {}",
            token.inner.description()
        )),
        None => Err(spanned_error!(origin.clone(), "expected jump target, found end of line")),
    }
}

fn operand(parser: &mut Parser, origin: &Line) -> Result<Operand, Diagnostic> {
    use TokenInner as TI;
    match parser.next_on_line() {
        Some(Token {
            inner: TI::ArgRegDirect,
            ..
        }) => Ok(Operand::RegDirect(register(parser, origin)?)),
        Some(Token {
            inner: TI::ArgIndexed,
            ..
        }) => {
            let offset = label_reference(parser, origin)?;
            let reg = register(parser, origin)?;
            Ok(Operand::Indexed(reg, offset))
        }
        Some(Token {
            inner: TI::ArgRegIndirect,
            ..
        }) => Ok(Operand::RegIndirect(register(parser, origin)?)),
        Some(Token {
            inner: TI::ArgRegIndirectAuto,
            ..
        }) => Ok(Operand::RegIndirectAuto(register(parser, origin)?)),
        Some(Token {
            inner: TI::ArgSymbolic,
            ..
        }) => Ok(Operand::Symbolic(label_reference(parser, origin)?)),
        Some(Token {
            inner: TI::ArgImmediate,
            ..
        }) => Ok(Operand::Immediate(label_reference(parser, origin)?)),
        Some(Token {
            inner: TI::ArgAbsolute,
            ..
        }) => Ok(Operand::Absolute(label_reference(parser, origin)?)),
        Some(token) => Err(spanned_error!(
            origin.clone(),
            "expected operand, found {}",
            token.inner.description()
        )),
        None => Err(spanned_error!(origin.clone(), "expected operand, found end of line")),
    }
}

fn register(parser: &mut Parser, origin: &Line) -> Result<u8, Diagnostic> {
    match parser.next_on_line() {
        Some(Token {
            inner: TokenInner::Value(reg),
            ..
        }) if (0..16).contains(&reg) => Ok(reg as u8),
        _ => Err(spanned_error!(origin.clone(), "expected register field").as_bug()),
    }
}

fn label_reference(parser: &mut Parser, origin: &Line) -> Result<LabelReference, Diagnostic> {
    match parser.next_on_line() {
        Some(Token {
            inner: TokenInner::Value(value),
            ..
        }) => Ok(LabelReference::Value(value)),
        Some(Token {
            inner: TokenInner::LabelVal(name),
            ..
        }) => Ok(LabelReference::Label(name)),
        Some(token) => Err(spanned_error!(
            origin.clone(),
            "expected value, found {}",
            token.inner.description()
        )),
        None => Err(spanned_error!(origin.clone(), "expected value, found end of line")),
    }
}
