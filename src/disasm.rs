//! Disassembler: word stream → assembly text.
//!
//! Decoding mirrors the emulator's classification exactly; rendering then
//! runs through the reverse-emulation table so the short forms the
//! assembler accepts (`ret`, `nop`, `clr`, …) come back out. The reverse
//! substitutions are generated once from the same emulated-mnemonic table
//! the parser rewrites with.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::assembler::inst::{InstKind, EMULATED, MNEMONICS};
use crate::emulator::{DoubleWord, JumpWord, SingleWord};

const SINGLE_NAMES: [&str; 7] = ["rrc", "swpb", "rra", "sxt", "push", "call", "reti"];
const JUMP_NAMES: [&str; 8] = ["jne", "jeq", "jnc", "jc", "jn", "jge", "jl", "jmp"];
const DOUBLE_NAMES: [&str; 12] = [
    "mov", "add", "addc", "subc", "sub", "cmp", "dadd", "bit", "bic", "bis", "xor", "and",
];

struct Walker<'a> {
    words: &'a [u16],
    index: usize,
    addr: u16,
}

impl Walker<'_> {
    fn next_word(&mut self) -> Option<u16> {
        let word = self.words.get(self.index).copied()?;
        self.index += 1;
        self.addr = self.addr.wrapping_add(2);
        Some(word)
    }
}

fn reg_name(reg: u8) -> String {
    match reg {
        0 => "pc".to_owned(),
        1 => "sp".to_owned(),
        2 => "sr".to_owned(),
        reg => format!("r{reg}"),
    }
}

/// Renders a source operand, consuming an extension word when the mode
/// requires one.
fn src_operand(
    w: &mut Walker,
    as_mode: u8,
    reg: u8,
    byte: bool,
    labels: &HashMap<u16, String>,
) -> Option<String> {
    Some(match (as_mode, reg) {
        // Constant generator.
        (0b00, 3) => "#0".to_owned(),
        (0b01, 3) => "#1".to_owned(),
        (0b10, 3) => "#2".to_owned(),
        (0b11, 3) => "#-1".to_owned(),
        (0b10, 2) => "#4".to_owned(),
        (0b11, 2) => "#8".to_owned(),

        (0b00, reg) => reg_name(reg),
        (0b01, 2) => {
            let addr = w.next_word()?;
            match labels.get(&addr) {
                Some(label) => format!("&{label}"),
                None => format!("&{addr:#x}"),
            }
        }
        (0b01, 0) => {
            let ext_addr = w.addr;
            let target = ext_addr.wrapping_add(w.next_word()?);
            match labels.get(&target) {
                Some(label) => label.clone(),
                None => format!("{target:#x}"),
            }
        }
        (0b01, reg) => format!("{:#x}({})", w.next_word()?, reg_name(reg)),
        (0b10, reg) => format!("@{}", reg_name(reg)),
        (0b11, 0) => {
            let ext = w.next_word()?;
            // Byte immediates live in the extension word's high byte.
            let value = if byte { ext >> 8 } else { ext };
            format!("#{value:#x}")
        }
        (0b11, reg) => format!("@{}+", reg_name(reg)),
        _ => unreachable!("As is a 2-bit field"),
    })
}

fn dst_operand(w: &mut Walker, ad: u8, reg: u8, labels: &HashMap<u16, String>) -> Option<String> {
    Some(match (ad, reg) {
        (0, reg) => reg_name(reg),
        (_, 2) => {
            let addr = w.next_word()?;
            match labels.get(&addr) {
                Some(label) => format!("&{label}"),
                None => format!("&{addr:#x}"),
            }
        }
        (_, 0) => {
            let ext_addr = w.addr;
            let target = ext_addr.wrapping_add(w.next_word()?);
            match labels.get(&target) {
                Some(label) => label.clone(),
                None => format!("{target:#x}"),
            }
        }
        (_, reg) => format!("{:#x}({})", w.next_word()?, reg_name(reg)),
    })
}

fn suffix(byte: bool) -> &'static str {
    if byte {
        ".b"
    } else {
        ""
    }
}

fn render(w: &mut Walker, word: u16, labels: &HashMap<u16, String>) -> Option<String> {
    if word >> 13 == 0b001 {
        let decoded = JumpWord::from_bytes(word.to_le_bytes());
        let field = decoded.offset() as i32;
        let offset = if field > 512 { field - 1024 } else { field };
        let mnemonic = JUMP_NAMES[decoded.cond() as usize];

        let target = w.addr.wrapping_add((2 * offset) as u16);
        if let Some(label) = labels.get(&target) {
            return Some(format!("{mnemonic} {label}"));
        }
        // No label: fall back to the displacement form the assembler takes.
        let displacement = 2 * offset + 2;
        return Some(if displacement < 0 {
            format!("{mnemonic} -{:#x}", -displacement)
        } else {
            format!("{mnemonic} {displacement:#x}")
        });
    }

    if word >> 10 == 0b000100 {
        let decoded = SingleWord::from_bytes(word.to_le_bytes());
        let Some(mnemonic) = SINGLE_NAMES.get(decoded.op() as usize).copied() else {
            return Some(format!("; data {word:#06x}"));
        };
        if decoded.op() == 0b110 {
            return Some("reti".to_owned());
        }
        let src = src_operand(w, decoded.as_mode(), decoded.reg(), decoded.bw(), labels)?;
        return Some(format!("{mnemonic}{} {src}", suffix(decoded.bw())));
    }

    if word >> 12 >= 0b0100 {
        let decoded = DoubleWord::from_bytes(word.to_le_bytes());
        let mnemonic = DOUBLE_NAMES[decoded.op() as usize - 4];
        let src = src_operand(w, decoded.as_mode(), decoded.src(), decoded.bw(), labels)?;
        let dst = dst_operand(w, decoded.ad() as u8, decoded.dst(), labels)?;
        return Some(format!("{mnemonic}{} {src}, {dst}", suffix(decoded.bw())));
    }

    // Reserved opcode space; keep the raw word visible.
    Some(format!("; data {word:#06x}"))
}

/// A reverse substitution: real-instruction rendering → emulated form.
struct Rewrite {
    re: Regex,
    replacement: String,
    /// Capture indices that must match for the rewrite to apply (`rla`,
    /// `rlc` need the same operand twice; regex patterns have no
    /// backreferences).
    same: Option<(usize, usize)>,
}

static REWRITES: Lazy<Vec<Rewrite>> = Lazy::new(build_rewrites);

fn build_rewrites() -> Vec<Rewrite> {
    let mut out = Vec::new();

    for (name, em) in EMULATED.entries() {
        let info = MNEMONICS
            .get(em.target)
            .expect("emulated table targets a real mnemonic");

        let mut pattern = format!("^{}", regex::escape(em.target));
        let mut replacement = (*name).to_owned();
        let mut group = 1;
        if em.byte_ok {
            pattern.push_str(r"(\.b)?");
            replacement.push_str("${1}");
            group += 1;
        }
        pattern.push(' ');

        let mut captures = Vec::new();
        for (index, template) in em.operands.iter().enumerate() {
            if index > 0 {
                pattern.push_str(", ");
            }
            if *template == "{0}" {
                pattern.push_str("(.+)");
                captures.push(group);
                group += 1;
            } else if matches!(info.kind, InstKind::Jump(_)) {
                // Jump offsets render in hex.
                let value = crate::assembler::lex::parse_int(template)
                    .expect("emulated jump offsets are literals");
                pattern.push_str(&regex::escape(&format!("{value:#x}")));
            } else {
                pattern.push_str(&regex::escape(template));
            }
        }
        pattern.push('$');

        if let Some(first) = captures.first() {
            replacement.push_str(&format!(" ${{{first}}}"));
        }

        out.push(Rewrite {
            re: Regex::new(&pattern).expect("generated reverse pattern compiles"),
            replacement,
            same: match captures[..] {
                [a, b] => Some((a, b)),
                _ => None,
            },
        });
    }

    out
}

/// Applies the reverse-emulation table; the shortest rendering wins.
fn reduce(line: &str) -> String {
    let mut best = line.to_owned();
    for rewrite in REWRITES.iter() {
        let Some(caps) = rewrite.re.captures(line) else {
            continue;
        };
        if let Some((a, b)) = rewrite.same {
            if caps.get(a).map(|m| m.as_str()) != caps.get(b).map(|m| m.as_str()) {
                continue;
            }
        }
        let mut candidate = String::new();
        caps.expand(&rewrite.replacement, &mut candidate);
        let candidate = candidate.trim().to_owned();
        if candidate.len() < best.len() {
            best = candidate;
        }
    }
    best
}

/// Disassembles a word stream starting at `start`.
///
/// Zero words are segment padding and produce no output. Known addresses
/// print their label on a line of its own; `$`-scoped labels skip the
/// separating blank line.
pub fn disassemble(words: &[u16], start: u16, labels: &HashMap<u16, String>) -> String {
    let mut out = String::new();
    let mut w = Walker {
        words,
        index: 0,
        addr: start,
    };

    loop {
        let line_addr = w.addr;
        let Some(word) = w.next_word() else {
            break;
        };
        if word == 0 {
            continue;
        }

        if let Some(label) = labels.get(&line_addr) {
            if !label.starts_with('$') && !out.is_empty() {
                out.push('\n');
            }
            out.push_str(label);
            out.push_str(":\n");
        }

        match render(&mut w, word, labels) {
            Some(rendered) => {
                out.push_str(&reduce(&rendered));
                out.push('\n');
            }
            None => break,
        }
    }

    out
}

#[derive(Debug, clap::Args)]
pub struct DasmArgs {
    /// Program image (base64 or raw).
    #[clap(value_parser, default_value = "-")]
    input: clio::Input,
}

/// The `dasm` subcommand: prints each segment of an image as assembly.
pub fn dump(mut args: DasmArgs) -> Result<(), crate::diagnostic::Diagnostic> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::io::Read;

    use crate::error;

    let mut raw = Vec::new();
    args.input
        .read_to_end(&mut raw)
        .map_err(|err| error!("failed to read input: {err}"))?;
    let decoded = std::str::from_utf8(&raw)
        .ok()
        .and_then(|text| STANDARD.decode(text.trim()).ok());
    let bytes = decoded.unwrap_or(raw);

    let segments = crate::assembler::compile::parse_image(&bytes)?;
    let labels = HashMap::new();
    for segment in &segments {
        println!("; segment at {:#06x}", segment.start);
        print!("{}", disassemble(&segment.words, segment.start, &labels));
    }

    Ok(())
}
