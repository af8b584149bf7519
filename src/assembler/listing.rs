//! Listing output: label table, annotated code, and line map.

use std::fmt::Write;

use super::compile::Program;

fn rule(title: &str) -> String {
    format!("----------|{title}|----------\n")
}

fn words_hex(words: &[u16]) -> String {
    words
        .iter()
        .map(|w| format!("{w:04X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Renders the three-section listing for an assembled program.
pub fn listing(program: &Program) -> String {
    let mut out = String::new();

    out.push_str(&rule("Labels"));
    let mut labels: Vec<(&String, &u16)> = program.labels.iter().collect();
    labels.sort();
    for (name, addr) in labels {
        let _ = writeln!(out, "{name}\t{addr:#06x}");
    }

    out.push_str(&rule("Code"));
    for entry in &program.compiled {
        if entry.break_before {
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "{:#06x}\t{}\t{}\t{}",
            entry.addr,
            words_hex(&entry.words),
            entry.origin.text,
            entry.labels.join(" ")
        );
    }

    out.push_str(&rule("Line Map"));
    for entry in &program.compiled {
        // Only top-level source lines; included and macro-expanded lines
        // already appear under their invocation.
        if entry.origin.file.is_empty() && !entry.words.is_empty() {
            let _ = writeln!(
                out,
                "{}\t{:#06x}\t{}",
                entry.origin.number,
                entry.addr,
                words_hex(&entry.words)
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{compile, lex, parse, source, Errors};

    fn assemble(text: &str) -> Program {
        let mut errors = Errors::new();
        let tokens = lex::lex(&source::load(text, None), &mut errors);
        let entries = parse::parse(tokens, &mut errors);
        assert!(errors.is_empty());
        compile::compile(&entries, 0x4400).unwrap()
    }

    #[test]
    fn sections_present() {
        let text = listing(&assemble("main: mov #0x4400 sp\nret"));
        assert!(text.contains("|Labels|"));
        assert!(text.contains("|Code|"));
        assert!(text.contains("|Line Map|"));
        assert!(text.contains("main\t0x4400"));
        assert!(text.contains("4031 4400"));
    }

    #[test]
    fn line_map_covers_root_lines() {
        let text = listing(&assemble("mov #0x4400 sp\nret"));
        let map: Vec<&str> = text
            .lines()
            .skip_while(|l| !l.contains("|Line Map|"))
            .skip(1)
            .collect();
        assert_eq!(map.len(), 2);
        assert!(map[0].starts_with("1\t0x4400"));
        assert!(map[1].starts_with("2\t0x4404"));
    }
}
