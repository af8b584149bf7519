//! Address resolution and binary emission.
//!
//! Pass 1 walks the instruction list assigning addresses and collecting the
//! label map; pass 2 compiles every instruction into segments. Compile
//! errors are gathered across the whole pass and surfaced as one batch.

use std::collections::HashMap;

use super::inst::{Entry, Instruction};
use super::source::Line;
use super::Errors;
use crate::diagnostic::Reference;

/// A contiguous run of words at a start address.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start: u16,
    pub words: Vec<u16>,
}

impl Segment {
    pub fn end(&self) -> u16 {
        self.start.wrapping_add(2 * self.words.len() as u16)
    }
}

/// One compiled instruction, kept around for the listing generator.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub origin: Line,
    pub labels: Vec<String>,
    pub addr: u16,
    pub words: Vec<u16>,
    /// A `.dbgbrk` preceded this entry; the listing prints a blank line.
    pub break_before: bool,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub entry: u16,
    pub segments: Vec<Segment>,
    pub labels: HashMap<String, u16>,
    pub compiled: Vec<Compiled>,
}

pub fn compile(entries: &[Entry], base: u16) -> Result<Program, Errors> {
    let mut errors = Errors::new();

    // Pass 1: addresses for every label (and duplicate detection).
    let mut labels: HashMap<String, u16> = HashMap::new();
    let mut origins: HashMap<String, Line> = HashMap::new();
    let mut pc = base;
    for entry in entries {
        for label in &entry.labels {
            if let Some(first) = origins.get(label) {
                errors.push(crate::diagnostic::Diagnostic::referencing_error(
                    entry.origin.clone(),
                    format!("duplicate definitions of label `{label}`"),
                    Reference::new(first.clone(), "label originally defined here"),
                ));
                continue;
            }
            labels.insert(label.clone(), pc);
            origins.insert(label.clone(), entry.origin.clone());
        }
        pc = pc.wrapping_add(2 * entry.num_words());
    }

    // Pass 2: compile into segments. Padding closes the current segment;
    // interrupt fixups are deferred to one-word postfix segments.
    let mut segments: Vec<Segment> = Vec::new();
    let mut postfix: Vec<Segment> = Vec::new();
    let mut compiled: Vec<Compiled> = Vec::new();
    let mut current = Segment {
        start: base,
        words: Vec::new(),
    };
    let mut break_before = false;
    pc = base;

    for entry in entries {
        match &entry.inst {
            Instruction::Padding => {
                if !current.words.is_empty() {
                    segments.push(current);
                }
                current = Segment {
                    start: pc,
                    words: Vec::new(),
                };
                break_before = true;
                continue;
            }
            Instruction::Interrupt { vector, target } => {
                match target.resolve(&labels, &entry.origin) {
                    Ok(addr) => postfix.push(Segment {
                        start: *vector,
                        words: vec![addr as u16],
                    }),
                    Err(err) => errors.push(err),
                }
                continue;
            }
            _ => {}
        }

        match entry.compile(pc, &labels) {
            Ok(words) => {
                debug_assert_eq!(words.len() as u16, entry.num_words());
                compiled.push(Compiled {
                    origin: entry.origin.clone(),
                    labels: entry.labels.clone(),
                    addr: pc,
                    words: words.clone(),
                    break_before,
                });
                if !words.is_empty() {
                    break_before = false;
                }
                current.words.extend(words);
            }
            Err(err) => errors.push(err),
        }
        pc = pc.wrapping_add(2 * entry.num_words());
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    if !current.words.is_empty() {
        segments.push(current);
    }

    // Startup vector first, then the deferred interrupt fixups.
    segments.push(Segment {
        start: 0xFFFE,
        words: vec![base],
    });
    segments.append(&mut postfix);

    segments.sort_by_key(|s| s.start);
    let segments = merge(segments);

    Ok(Program {
        entry: base,
        segments,
        labels,
        compiled,
    })
}

/// Merges adjacent segments until no pair satisfies `prev.end ==
/// next.start`.
fn merge(mut segments: Vec<Segment>) -> Vec<Segment> {
    loop {
        let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
        let mut changed = false;

        for segment in segments {
            match merged.last_mut() {
                Some(prev) if prev.end() == segment.start => {
                    prev.words.extend(segment.words);
                    changed = true;
                }
                _ => merged.push(segment),
            }
        }

        if !changed {
            return merged;
        }
        segments = merged;
    }
}

/// Serializes the program image: `FF FF` magic, big-endian segment count,
/// then each segment as big-endian start, byte length, and words.
pub fn image(program: &Program) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFF];
    bytes.extend((program.segments.len() as u16).to_be_bytes());
    for segment in &program.segments {
        bytes.extend(segment.start.to_be_bytes());
        bytes.extend((2 * segment.words.len() as u16).to_be_bytes());
        for word in &segment.words {
            bytes.extend(word.to_be_bytes());
        }
    }
    bytes
}

/// Parses an image back into segments; the emulator and disassembler load
/// through this.
pub fn parse_image(bytes: &[u8]) -> Result<Vec<Segment>, crate::diagnostic::Diagnostic> {
    use crate::error;

    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xFF {
        return Err(error!("bad image magic"));
    }
    let count = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let mut segments = Vec::with_capacity(count);
    let mut at = 4;

    for _ in 0..count {
        if bytes.len() < at + 4 {
            return Err(error!("truncated segment header"));
        }
        let start = u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        let len = u16::from_be_bytes([bytes[at + 2], bytes[at + 3]]) as usize;
        at += 4;
        if len % 2 != 0 {
            return Err(error!("segment length {len} is not word-aligned"));
        }
        if bytes.len() < at + len {
            return Err(error!("truncated segment body"));
        }
        let words = bytes[at..at + len]
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        at += len;
        segments.push(Segment { start, words });
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{lex, parse, source};

    fn compile_text(text: &str, base: u16) -> Program {
        let mut errors = Errors::new();
        let tokens = lex::lex(&source::load(text, None), &mut errors);
        let entries = parse::parse(tokens, &mut errors);
        assert!(errors.is_empty(), "unexpected diagnostics: {errors:?}");
        compile(&entries, base).expect("compile failed")
    }

    #[test]
    fn mov_reti_image_prefix() {
        let program = compile_text("mov #0x4400 sp\nreti", 0x4400);
        let code = &program.segments[0];
        assert_eq!(code.start, 0x4400);
        assert_eq!(code.words[..3], [0x4031, 0x4400, 0x1300]);
    }

    #[test]
    fn startup_vector_present() {
        let program = compile_text("ret", 0x4400);
        let startup = program
            .segments
            .iter()
            .find(|s| s.start == 0xFFFE)
            .expect("missing startup vector");
        assert_eq!(startup.words, vec![0x4400]);
    }

    #[test]
    fn interrupt_vectors_are_postfix_segments() {
        let program = compile_text("isr: reti\n.interrupt 0xFFF8 isr", 0x4400);
        let vector = program
            .segments
            .iter()
            .find(|s| s.start == 0xFFF8)
            .expect("missing interrupt vector");
        assert_eq!(vector.words, vec![0x4400]);
    }

    #[test]
    fn merge_reaches_fixed_point() {
        let merged = merge(vec![
            Segment {
                start: 0x10,
                words: vec![1],
            },
            Segment {
                start: 0x12,
                words: vec![2],
            },
            Segment {
                start: 0x14,
                words: vec![3],
            },
            Segment {
                start: 0x20,
                words: vec![4],
            },
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].words, vec![1, 2, 3]);
        for pair in merged.windows(2) {
            assert_ne!(pair[0].end(), pair[1].start);
        }
    }

    #[test]
    fn padding_forces_segment_boundary() {
        let program = compile_text("ret\n.dbgbrk\nret", 0x4400);
        // Adjacent after the break, so the merge pass folds them back
        // together; the boundary still exercised the split path.
        assert!(program.segments.iter().any(|s| s.start == 0x4400));
    }

    #[test]
    fn duplicate_labels_rejected() {
        let mut errors = Errors::new();
        let tokens = lex::lex(&source::load("x: ret\nx: ret", None), &mut errors);
        let entries = parse::parse(tokens, &mut errors);
        assert!(errors.is_empty());
        let failure = compile(&entries, 0x4400).unwrap_err();
        assert!(failure[0].message().contains("duplicate"));
    }

    #[test]
    fn label_addresses_advance_by_words() {
        let program = compile_text("a: mov #0x4400 sp\nb: ret\nc: reti", 0x4400);
        assert_eq!(program.labels["a"], 0x4400);
        assert_eq!(program.labels["b"], 0x4404);
        assert_eq!(program.labels["c"], 0x4406);
    }

    #[test]
    fn image_round_trip() {
        let program = compile_text("mov #0x4400 sp\nret", 0x4400);
        let bytes = image(&program);
        assert_eq!(&bytes[..2], &[0xFF, 0xFF]);
        let segments = parse_image(&bytes).unwrap();
        assert_eq!(segments, program.segments);
    }
}
