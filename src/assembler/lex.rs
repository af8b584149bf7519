//! Line tokenizer.
//!
//! A single left-to-right pass over the preprocessed lines, producing the
//! typed token stream the instruction parser consumes. Operand text is
//! scanned by a [`logos`]-derived sub-lexer; everything line-shaped (labels,
//! directives, mnemonics) is handled here because the dialect is strictly
//! line-oriented.

use logos::{Lexer, Logos};
use once_cell::sync::Lazy;
use regex::Regex;

use super::source::Line;
use super::Errors;
use crate::diagnostic::Diagnostic;
use crate::spanned_error;

pub type TokenStream = Vec<Token>;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub inner: TokenInner,
    pub origin: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenInner {
    /// Start of a source line; updates the parser's current origin.
    LineStart,
    DbgBreak,
    ListingComment(String),
    Label(String),
    LabelVal(String),
    Mnemonic(String),
    /// `true` for `.b`, `false` for `.w`.
    ModeIndicator(bool),
    Value(i32),
    ArgRegDirect,
    ArgIndexed,
    ArgRegIndirect,
    ArgRegIndirectAuto,
    ArgSymbolic,
    ArgImmediate,
    ArgAbsolute,
    DataMode,
    CString8Data(String),
    Interrupt(u16),
}

impl TokenInner {
    pub fn description(&self) -> &'static str {
        match self {
            TokenInner::LineStart => "line start",
            TokenInner::DbgBreak => "debug break",
            TokenInner::ListingComment(_) => "listing comment",
            TokenInner::Label(_) => "label",
            TokenInner::LabelVal(_) => "label reference",
            TokenInner::Mnemonic(_) => "mnemonic",
            TokenInner::ModeIndicator(_) => "mode indicator",
            TokenInner::Value(_) => "value",
            TokenInner::ArgRegDirect => "register operand",
            TokenInner::ArgIndexed => "indexed operand",
            TokenInner::ArgRegIndirect => "indirect operand",
            TokenInner::ArgRegIndirectAuto => "autoincrement operand",
            TokenInner::ArgSymbolic => "symbolic operand",
            TokenInner::ArgImmediate => "immediate operand",
            TokenInner::ArgAbsolute => "absolute operand",
            TokenInner::DataMode => "data section",
            TokenInner::CString8Data(_) => "string data",
            TokenInner::Interrupt(_) => "interrupt directive",
        }
    }
}

/// Parses a `0x`-prefixed hex or decimal integer with an optional sign.
pub fn parse_int(s: &str) -> Option<i32> {
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = match rest.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => rest.parse::<i64>().ok()?,
    };
    let signed = if negative { -value } else { value };
    i32::try_from(signed).ok()
}

fn register_number(s: &str) -> Option<u8> {
    match s {
        "pc" => Some(0),
        "sp" => Some(1),
        "sr" => Some(2),
        "cg" => Some(3),
        _ => {
            let n: u8 = s.strip_prefix('r')?.parse().ok()?;
            (n < 16).then_some(n)
        }
    }
}

/// One operand's worth of argument text.
///
/// Composite forms (indexed, indirect) are matched whole and unpacked in the
/// callbacks.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = Diagnostic)]
#[logos(skip r"[ \t]+")]
enum ArgToken {
    #[regex(r"r[0-9]+|pc|sp|sr|cg", ArgToken::register, priority = 10)]
    Register(u8),

    #[regex(r"[+-]?(0x[0-9a-fA-F]+|[0-9]+)\((r[0-9]+|pc|sp|sr|cg)\)", ArgToken::indexed)]
    Indexed((i32, u8)),

    #[regex(r"[A-Za-z$_][A-Za-z0-9$_]*\((r[0-9]+|pc|sp|sr|cg)\)", ArgToken::label_indexed)]
    LabelIndexed((String, u8)),

    #[regex(r"@(r[0-9]+|pc|sp|sr|cg)\+?", ArgToken::indirect)]
    Indirect((u8, bool)),

    #[regex(r"#[+-]?(0x[0-9a-fA-F]+|[0-9]+)", ArgToken::immediate)]
    Immediate(i32),

    #[regex(r"#[A-Za-z$_][A-Za-z0-9$_]*", ArgToken::immediate_label)]
    ImmediateLabel(String),

    #[regex(r"&(0x[0-9a-fA-F]+|[0-9]+)", ArgToken::absolute)]
    Absolute(i32),

    #[regex(r"&[A-Za-z$_][A-Za-z0-9$_]*", ArgToken::absolute_label)]
    AbsoluteLabel(String),

    #[regex(r"0x[0-9a-fA-F]+|[0-9]+", ArgToken::number)]
    Number(i32),

    #[regex(r"[A-Za-z$_][A-Za-z0-9$_]*", ArgToken::symbol, priority = 2)]
    Symbol(String),
}

impl ArgToken {
    fn register(lex: &mut Lexer<ArgToken>) -> Result<u8, Diagnostic> {
        register_number(lex.slice())
            .ok_or_else(|| Diagnostic::error(format!("no such register `{}`", lex.slice())))
    }

    fn indexed(lex: &mut Lexer<ArgToken>) -> Result<(i32, u8), Diagnostic> {
        let slice = lex.slice();
        let open = slice.find('(').ok_or_else(|| Diagnostic::error("missing `(`"))?;
        let offset = parse_int(&slice[..open])
            .ok_or_else(|| Diagnostic::error(format!("bad index offset in `{slice}`")))?;
        let reg = register_number(&slice[open + 1..slice.len() - 1])
            .ok_or_else(|| Diagnostic::error(format!("no such register in `{slice}`")))?;
        Ok((offset, reg))
    }

    fn label_indexed(lex: &mut Lexer<ArgToken>) -> Result<(String, u8), Diagnostic> {
        let slice = lex.slice();
        let open = slice.find('(').ok_or_else(|| Diagnostic::error("missing `(`"))?;
        let reg = register_number(&slice[open + 1..slice.len() - 1])
            .ok_or_else(|| Diagnostic::error(format!("no such register in `{slice}`")))?;
        Ok((slice[..open].to_owned(), reg))
    }

    fn indirect(lex: &mut Lexer<ArgToken>) -> Result<(u8, bool), Diagnostic> {
        let slice = lex.slice().strip_prefix('@').unwrap_or(lex.slice());
        let auto = slice.ends_with('+');
        let name = slice.strip_suffix('+').unwrap_or(slice);
        let reg = register_number(name)
            .ok_or_else(|| Diagnostic::error(format!("no such register `{name}`")))?;
        Ok((reg, auto))
    }

    fn immediate(lex: &mut Lexer<ArgToken>) -> Result<i32, Diagnostic> {
        parse_int(&lex.slice()[1..])
            .ok_or_else(|| Diagnostic::error(format!("bad immediate `{}`", lex.slice())))
    }

    fn immediate_label(lex: &mut Lexer<ArgToken>) -> String {
        lex.slice()[1..].to_owned()
    }

    fn absolute(lex: &mut Lexer<ArgToken>) -> Result<i32, Diagnostic> {
        parse_int(&lex.slice()[1..])
            .ok_or_else(|| Diagnostic::error(format!("bad absolute address `{}`", lex.slice())))
    }

    fn absolute_label(lex: &mut Lexer<ArgToken>) -> String {
        lex.slice()[1..].to_owned()
    }

    fn number(lex: &mut Lexer<ArgToken>) -> Result<i32, Diagnostic> {
        parse_int(lex.slice())
            .ok_or_else(|| Diagnostic::error(format!("bad numeric operand `{}`", lex.slice())))
    }

    fn symbol(lex: &mut Lexer<ArgToken>) -> String {
        lex.slice().to_owned()
    }
}

pub const JUMP_MNEMONICS: &[&str] = &[
    "jmp", "jne", "jnz", "jeq", "jz", "jnc", "jlo", "jc", "jhs", "jn", "jge", "jl",
];

static LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z$_][A-Za-z0-9$_]*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Text,
    Data,
}

struct Tokenizer {
    text: TokenStream,
    data: TokenStream,
    mode: Mode,
    /// Local-label prefixes; `$`-labels are mangled with the top entry.
    locblk: Vec<u32>,
    next_block: u32,
}

impl Tokenizer {
    fn new() -> Self {
        Tokenizer {
            text: TokenStream::new(),
            data: TokenStream::new(),
            mode: Mode::Text,
            locblk: vec![0],
            next_block: 1,
        }
    }

    fn push(&mut self, inner: TokenInner, origin: &Line) {
        let token = Token {
            inner,
            origin: origin.clone(),
        };
        match self.mode {
            Mode::Text => self.text.push(token),
            Mode::Data => self.data.push(token),
        }
    }

    fn fresh_block(&mut self) -> u32 {
        let block = self.next_block;
        self.next_block += 1;
        block
    }

    /// `$`-labels are scoped: they get the enclosing local block's prefix.
    fn scoped(&self, label: &str) -> String {
        if label.starts_with('$') {
            format!("$blk{}{}", self.locblk.last().copied().unwrap_or(0), label)
        } else {
            label.to_owned()
        }
    }
}

/// Tokenizes the preprocessed lines.
///
/// Data-mode tokens accumulate separately and are appended to the text
/// stream behind a `DbgBreak, DataMode` prelude, so data sections always
/// land after the code regardless of where `.data` blocks appear.
pub fn lex(lines: &[Line], errors: &mut Errors) -> TokenStream {
    let mut t = Tokenizer::new();

    for line in lines {
        let text = strip_comment(&line.text);

        t.push(TokenInner::LineStart, line);

        if text.is_empty() {
            continue;
        }

        if let Some(msg) = text.strip_prefix(";!!") {
            t.push(TokenInner::ListingComment(msg.trim().to_owned()), line);
            continue;
        }

        if let Some(msg) = text.strip_prefix("!!!") {
            errors.push(spanned_error!(line.clone(), "{}", msg));
            continue;
        }

        statement(&mut t, text, line, errors);
    }

    let mut stream = t.text;
    if !t.data.is_empty() {
        let origin = t.data[0].origin.clone();
        stream.push(Token {
            inner: TokenInner::DbgBreak,
            origin: origin.clone(),
        });
        stream.push(Token {
            inner: TokenInner::DataMode,
            origin,
        });
        stream.extend(t.data);
    }

    collapse_line_starts(stream)
}

fn strip_comment(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with(";!!") {
        return trimmed;
    }
    match trimmed.find(';') {
        Some(at) => trimmed[..at].trim_end(),
        None => trimmed,
    }
}

fn statement(t: &mut Tokenizer, text: &str, line: &Line, errors: &mut Errors) {
    match text {
        ".dbgbrk" => {
            t.push(TokenInner::DbgBreak, line);
            return;
        }
        ".data" => {
            if t.mode == Mode::Data {
                errors.push(spanned_error!(line.clone(), "already in data mode"));
            }
            t.mode = Mode::Data;
            return;
        }
        ".text" => {
            if t.mode == Mode::Text {
                errors.push(spanned_error!(line.clone(), "already in text mode"));
            }
            t.mode = Mode::Text;
            return;
        }
        ".locblk" => {
            let block = t.fresh_block();
            t.locblk = vec![block];
            return;
        }
        ".push_locblk" => {
            let block = t.fresh_block();
            t.locblk.push(block);
            return;
        }
        ".pop_locblk" => {
            t.locblk.pop();
            if t.locblk.is_empty() {
                let block = t.fresh_block();
                t.locblk.push(block);
            }
            return;
        }
        _ => {}
    }

    // String payloads may themselves contain `:`, so data directives are
    // matched ahead of the label split.
    if let Some(rest) = text.strip_prefix(".cstr8") {
        if t.mode != Mode::Data {
            errors.push(spanned_error!(line.clone(), "`.cstr8` is only valid in a data section"));
            return;
        }
        t.push(TokenInner::CString8Data(rest.trim_start().to_owned()), line);
        return;
    }

    if let Some(rest) = text.strip_prefix(".interrupt") {
        interrupt(t, rest.trim(), line, errors);
        return;
    }

    if let Some((label, rest)) = text.split_once(':') {
        let label = label.trim();
        if !LABEL.is_match(label) {
            errors.push(spanned_error!(line.clone(), "invalid label `{label}`"));
            return;
        }
        let scoped = t.scoped(label);
        t.push(TokenInner::Label(scoped), line);

        let rest = rest.trim();
        if !rest.is_empty() {
            statement(t, rest, line, errors);
        }
        return;
    }

    instruction(t, text, line, errors);
}

fn interrupt(t: &mut Tokenizer, rest: &str, line: &Line, errors: &mut Errors) {
    let mut parts = rest.split_whitespace();
    let (Some(vector), Some(target), None) = (parts.next(), parts.next(), parts.next()) else {
        errors.push(spanned_error!(line.clone(), "expected `.interrupt <vector> <label>`"));
        return;
    };
    let Some(vector) = parse_int(vector).and_then(|v| u16::try_from(v).ok()) else {
        errors.push(spanned_error!(line.clone(), "bad interrupt vector `{vector}`"));
        return;
    };
    if !LABEL.is_match(target) {
        errors.push(spanned_error!(line.clone(), "invalid label `{target}`"));
        return;
    }
    t.push(TokenInner::Interrupt(vector), line);
    let scoped = t.scoped(target);
    t.push(TokenInner::LabelVal(scoped), line);
}

fn instruction(t: &mut Tokenizer, text: &str, line: &Line, errors: &mut Errors) {
    let fields: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|f| !f.is_empty())
        .collect();

    if fields.len() > 3 {
        errors.push(spanned_error!(line.clone(), "too many operands"));
        return;
    }
    let Some(first) = fields.first() else {
        return;
    };

    let head = first.to_ascii_lowercase();
    let (mnemonic, indicator) = match head.split_once('.') {
        Some((name, "b")) => (name.to_owned(), Some(true)),
        Some((name, "w")) => (name.to_owned(), Some(false)),
        Some((_, suffix)) => {
            errors.push(spanned_error!(line.clone(), "unknown mode suffix `.{suffix}`"));
            return;
        }
        None => (head, None),
    };

    t.push(TokenInner::Mnemonic(mnemonic.clone()), line);
    if let Some(byte) = indicator {
        t.push(TokenInner::ModeIndicator(byte), line);
    }

    if JUMP_MNEMONICS.contains(&mnemonic.as_str()) {
        if fields.len() != 2 {
            errors.push(spanned_error!(line.clone(), "`{mnemonic}` expects exactly one target"));
            return;
        }
        let target = fields[1];
        match parse_int(target) {
            Some(offset) => t.push(TokenInner::Value(offset), line),
            None if LABEL.is_match(target) => {
                let scoped = t.scoped(target);
                t.push(TokenInner::LabelVal(scoped), line);
            }
            None => {
                errors.push(spanned_error!(line.clone(), "bad jump target `{target}`"));
            }
        }
        return;
    }

    for field in &fields[1..] {
        if let Err(err) = argument(t, field, line) {
            errors.push(err);
        }
    }
}

/// Scans one argument string into its marker + value token sequence.
///
/// Label references come back unscoped; [`lex`] applies the local-block
/// prefix before emission. The instruction parser reuses this for the
/// literal operands of emulated-instruction rewrite patterns.
pub fn scan_argument(field: &str) -> Result<Vec<TokenInner>, Diagnostic> {
    let mut lexer = ArgToken::lexer(field);
    let token = match lexer.next() {
        Some(Ok(token)) => token,
        Some(Err(err)) => return Err(err),
        None => return Err(Diagnostic::error(format!("malformed operand `{field}`"))),
    };
    if lexer.next().is_some() {
        return Err(Diagnostic::error(format!("malformed operand `{field}`")));
    }

    use TokenInner as TI;
    Ok(match token {
        ArgToken::Register(reg) => vec![TI::ArgRegDirect, TI::Value(reg as i32)],
        ArgToken::Indexed((offset, reg)) => {
            vec![TI::ArgIndexed, TI::Value(offset), TI::Value(reg as i32)]
        }
        ArgToken::LabelIndexed((label, reg)) => {
            vec![TI::ArgIndexed, TI::LabelVal(label), TI::Value(reg as i32)]
        }
        ArgToken::Indirect((reg, auto)) => vec![
            if auto {
                TI::ArgRegIndirectAuto
            } else {
                TI::ArgRegIndirect
            },
            TI::Value(reg as i32),
        ],
        ArgToken::Immediate(value) => vec![TI::ArgImmediate, TI::Value(value)],
        ArgToken::ImmediateLabel(label) => vec![TI::ArgImmediate, TI::LabelVal(label)],
        ArgToken::Absolute(addr) => vec![TI::ArgAbsolute, TI::Value(addr)],
        ArgToken::AbsoluteLabel(label) => vec![TI::ArgAbsolute, TI::LabelVal(label)],
        ArgToken::Number(value) => vec![TI::ArgSymbolic, TI::Value(value)],
        ArgToken::Symbol(label) => vec![TI::ArgSymbolic, TI::LabelVal(label)],
    })
}

/// Emits one argument's tokens, applying `$`-label scoping.
fn argument(t: &mut Tokenizer, field: &str, line: &Line) -> Result<(), Diagnostic> {
    let tokens = match scan_argument(field) {
        Ok(tokens) => tokens,
        Err(mut err) => {
            err.set_origin(line.clone());
            return Err(err);
        }
    };
    for token in tokens {
        let scoped = match token {
            TokenInner::LabelVal(label) => TokenInner::LabelVal(t.scoped(&label)),
            other => other,
        };
        t.push(scoped, line);
    }
    Ok(())
}

/// Collapses runs of consecutive `LineStart` tokens, keeping the last.
fn collapse_line_starts(stream: TokenStream) -> TokenStream {
    let mut out: TokenStream = Vec::with_capacity(stream.len());
    for token in stream {
        if token.inner == TokenInner::LineStart
            && out.last().map(|prev| &prev.inner) == Some(&TokenInner::LineStart)
        {
            *out.last_mut().unwrap() = token;
        } else {
            out.push(token);
        }
    }
    out
}
