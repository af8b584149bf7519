//! End-to-end scenarios: source text through the full pipeline, and where
//! it matters, on through the emulator.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::assembler::{assemble_source, compile::Segment, preproc, Assembly, Errors};
use crate::diagnostic::Diagnostic;
use crate::disasm;
use crate::emulator::{Emulator, Stop};
use crate::error;

const BASE: u16 = 0x4400;

fn emit_errors(errors: Errors) -> Diagnostic {
    for err in errors {
        err.force_emit();
    }
    error!("unable to assemble due to previous errors")
}

fn assemble(text: &str) -> Assembly {
    match assemble_source(text, None, BASE) {
        Ok(assembly) => assembly,
        Err(errors) => emit_errors(errors).scream(),
    }
}

fn code_segment(assembly: &Assembly) -> &Segment {
    assembly
        .program
        .segments
        .iter()
        .find(|s| s.start == BASE)
        .expect("missing code segment")
}

fn run_to_halt(assembly: &Assembly) -> Emulator {
    let mut emulator = Emulator::new();
    emulator.load(&assembly.program.segments).unwrap();
    match emulator.run(100_000) {
        Ok(Stop::CpuOff) => emulator,
        Ok(Stop::StepLimit) => panic!("program never halted"),
        Err(err) => panic!("execution fault: {err}"),
    }
}

/// Assembles and runs a fixture file. Leading `; rN: value` comment lines
/// state the expected register contents at halt.
fn test_file(path: &str) -> Result<(), Diagnostic> {
    let path = Path::new(path);
    let text = fs::read_to_string(path)
        .map_err(|err| error!("unable to read `{}`: {err}", path.display()))?;

    let mut expected: Vec<(u8, u16)> = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("; r") else {
            break;
        };
        let (reg, value) = rest
            .split_once(':')
            .ok_or_else(|| error!("malformed expectation `{line}`"))?;
        let reg: u8 = reg
            .trim()
            .parse()
            .map_err(|err| error!("bad register in `{line}`: {err}"))?;
        let value = crate::assembler::lex::parse_int(value.trim())
            .ok_or_else(|| error!("bad value in `{line}`"))?;
        expected.push((reg, value as u16));
    }

    let assembly =
        assemble_source(&text, path.parent(), BASE).map_err(emit_errors)?;
    let emulator = run_to_halt(&assembly);

    for (reg, value) in expected {
        assert_eq!(
            emulator.regs.get(reg),
            value,
            "r{reg} after `{}`",
            path.display()
        );
    }
    Ok(())
}

#[test]
fn mov_reti_image() {
    let assembly = assemble("mov #0x4400 sp\nreti");
    assert_eq!(code_segment(&assembly).words, vec![0x4031, 0x4400, 0x1300]);
    assert_eq!(&assembly.image[..4], &[0xFF, 0xFF, 0x00, 0x02]);
}

#[test]
fn swpb_assembles_and_round_trips() {
    let assembly = assemble("swpb r5");
    assert_eq!(code_segment(&assembly).words, vec![0x1085]);
    let text = disasm::disassemble(&[0x1085], 0x0010, &HashMap::new());
    assert_eq!(text.trim(), "swpb r5");
}

#[test]
fn macro_invocation_equals_direct_form() {
    let direct = assemble("mov r5 r6");
    let via_macro = assemble(".macro test(a, b)\nmov {a} {b}\n.endmacro\ntest(r5, r6)");
    assert_eq!(code_segment(&direct).words, code_segment(&via_macro).words);
    assert_eq!(direct.image, via_macro.image);
}

#[test]
fn recursive_macro_is_diagnosed() {
    let _guard = preproc::recursion_guard();
    let errors = assemble_source(".macro f(a)\nf({a})\n.endmacro\nf(r5)", None, BASE).unwrap_err();
    assert!(errors.iter().any(|e| e.message().contains("recursion limit")));
}

#[test]
fn recursive_macro_panics_the_assembly_in_panic_mode() {
    let _guard = preproc::recursion_guard();
    preproc::set_panic_on_recursion(true);
    let result = assemble_source(".macro g(a)\ng({a})\n.endmacro\ng(r5)", None, BASE);
    preproc::set_panic_on_recursion(false);
    let errors = result.unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message().contains("recursion limit"));
    assert!(errors[0]
        .origin()
        .is_some_and(|origin| origin.text.contains("g(r5)")));
}

#[test]
fn jmp_offset_executes() {
    let assembly = match assemble_source("jmp 0x10", None, 0x0000) {
        Ok(assembly) => assembly,
        Err(errors) => emit_errors(errors).scream(),
    };
    let code = assembly
        .program
        .segments
        .iter()
        .find(|s| s.start == 0x0000)
        .unwrap();
    assert_eq!(code.words, vec![0x3C07]);

    let mut emulator = Emulator::new();
    emulator.load(&assembly.program.segments).unwrap();
    emulator.step().unwrap();
    assert_eq!(emulator.regs.pc(), 0x0010);
}

#[test]
fn jmp_offset_is_self_relative_at_any_base() {
    // `jmp 0x10` must land 0x10 bytes past the jump wherever it is
    // assembled; a single base cannot tell that apart from an absolute
    // target, so exercise two.
    for base in [0x4400_u16, 0x8800] {
        let assembly = match assemble_source("jmp 0x10", None, base) {
            Ok(assembly) => assembly,
            Err(errors) => emit_errors(errors).scream(),
        };
        let code = assembly
            .program
            .segments
            .iter()
            .find(|s| s.start == base)
            .unwrap();
        assert_eq!(code.words, vec![0x3C07], "encoding is address-independent");

        let mut emulator = Emulator::new();
        emulator.load(&assembly.program.segments).unwrap();
        emulator.step().unwrap();
        assert_eq!(emulator.regs.pc(), base + 0x10);
    }
}

#[test]
fn hcf_loops_in_place_at_a_nonzero_base() {
    let assembly = assemble("hcf");
    assert_eq!(code_segment(&assembly).words, vec![0x3FFF]);
    let mut emulator = Emulator::new();
    emulator.load(&assembly.program.segments).unwrap();
    emulator.step().unwrap();
    assert_eq!(emulator.regs.pc(), BASE);
}

#[test]
fn ret_survives_the_round_trip() {
    let assembly = assemble("ret");
    assert_eq!(code_segment(&assembly).words, vec![0x4130]);
    let text = disasm::disassemble(&code_segment(&assembly).words, BASE, &HashMap::new());
    assert_eq!(text.trim(), "ret");
}

#[test]
fn literal_round_trip() {
    // Assemble, disassemble, reassemble: the words must be identical for
    // purely literal operands.
    let source = "mov #0x1234 r5\nadd 0x2(r4) r6\nmov.b #0x41 r7\npush @r9\nxor @r10+ r11\nswpb r5\njmp 0x10";
    let first = assemble(source);
    let text = disasm::disassemble(&code_segment(&first).words, BASE, &HashMap::new());
    let second = assemble(&text);
    assert_eq!(code_segment(&first).words, code_segment(&second).words);
}

#[test]
fn constant_generator_round_trip() {
    for value in ["#-1", "#0", "#1", "#2", "#4", "#8"] {
        let assembly = assemble(&format!("and {value} r5"));
        let words = &code_segment(&assembly).words;
        assert_eq!(words.len(), 1, "{value} must not emit an extension word");
        let text = disasm::disassemble(words, BASE, &HashMap::new());
        let again = assemble(&text);
        assert_eq!(words, &code_segment(&again).words, "{value}");
    }
}

#[test]
fn interrupt_directive_places_vector() {
    let assembly = assemble("isr: reti\n.interrupt 0xFFF0 isr");
    let vector = assembly
        .program
        .segments
        .iter()
        .find(|s| s.start == 0xFFF0)
        .expect("vector segment");
    assert_eq!(vector.words, vec![BASE]);
}

#[test]
fn data_strings_land_in_memory() {
    let assembly = assemble("start: bis #0x10 sr\n.data\nmsg: .cstr8 Hi\n.text");
    let emulator = run_to_halt(&assembly);
    let addr = assembly.program.labels["msg"];
    assert_eq!(emulator.mem.read_byte(addr), b'H');
    assert_eq!(emulator.mem.read_byte(addr + 1), b'i');
    assert_eq!(emulator.mem.read_byte(addr + 2), 0);
}

#[test]
fn local_labels_do_not_collide_across_macros() {
    let source = "\
.macro wait(n)
mov {n} r15
$spin: dec r15
jnz $spin
.endmacro
wait(#2)
wait(#3)
bis #0x10 sr";
    let assembly = assemble(source);
    let emulator = run_to_halt(&assembly);
    assert_eq!(emulator.regs.get(15), 0);
}

#[test]
fn defines_substitute_into_operands() {
    let assembly = assemble(".define \"0x4400\", STACK\nmov #[STACK] sp\nreti");
    assert_eq!(code_segment(&assembly).words[..2], [0x4031, 0x4400]);
}

#[test]
fn missing_include_is_a_diagnostic() {
    let errors = assemble_source(".include <missing.asm>\nret", None, BASE).unwrap_err();
    assert!(errors[0].message().contains("not found"));
}

#[test]
fn fib() {
    if let Err(err) = test_file("tests/fib.asm") {
        err.scream();
    }
}

#[test]
fn include_cycle() {
    if let Err(err) = test_file("tests/include_a.asm") {
        err.scream();
    }
}
