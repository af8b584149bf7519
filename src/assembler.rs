//! The assembly pipeline.
//!
//! `source text → lines → defines/macros → tokens → instructions →
//! segments → image`. Each stage accumulates diagnostics and keeps going;
//! compilation only runs once the earlier stages came back clean.

pub mod compile;
pub mod inst;
pub mod lex;
pub mod listing;
pub mod operand;
pub mod parse;
pub mod preproc;
pub mod source;

pub use crate::diagnostic::{Diagnostic, OptionalScream, ResultScream};
use crate::error;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Args;
use clap_verbosity_flag::{Level, WarnLevel};
use clio::{Input, Output};
use colored::Colorize;

pub type Errors = Vec<Diagnostic>;

pub static VERBOSITY: OnceLock<Verbosity> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verbosity {
    Quiet = 0,
    Error = 1,
    Warn = 2,
    Help = 3,
    Info = 4,
}

impl PartialOrd for Verbosity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Verbosity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

#[derive(Debug, Args)]
pub struct AssemblerArgs {
    /// Load address for the assembled code; the startup vector points here.
    #[clap(short, long, default_value = "0x4400", value_parser = parse_address)]
    base: u16,

    /// Print the listing before the image.
    #[clap(short, long)]
    list: bool,

    /// Dump the image bytes in hex before the base64.
    #[clap(short, long)]
    debug: bool,

    #[clap(value_parser, default_value = "-")]
    input: Input,
    #[clap(short, long, value_parser, default_value = "-")]
    output: Output,
}

fn parse_address(raw: &str) -> Result<u16, String> {
    lex::parse_int(raw)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| format!("`{raw}` is not a 16-bit address"))
}

/// An assembled program plus its serialized image.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub program: compile::Program,
    pub image: Vec<u8>,
}

/// Runs the whole pipeline on a source string.
pub fn assemble_source(text: &str, dir: Option<&Path>, base: u16) -> Result<Assembly, Errors> {
    let lines = source::load(text, dir);

    let mut errors = Errors::new();
    let lines = match preproc::preprocess(lines, &mut errors) {
        Ok(lines) => lines,
        Err(mut fatal) => {
            errors.append(&mut fatal);
            return Err(errors);
        }
    };

    let tokens = lex::lex(&lines, &mut errors);
    let entries = parse::parse(tokens, &mut errors);

    // Diagnostics anywhere upstream skip compilation entirely.
    if !errors.is_empty() {
        return Err(errors);
    }

    let program = compile::compile(&entries, base)?;
    let image = compile::image(&program);
    Ok(Assembly { program, image })
}

/// The `asm` subcommand: reads source, writes base64 (or `<FAILURE>`).
pub fn assemble(
    mut args: AssemblerArgs,
    verbosity: clap_verbosity_flag::Verbosity<WarnLevel>,
) -> Result<(), Errors> {
    let verbose = match verbosity.log_level() {
        Some(level) => match level {
            Level::Error => Verbosity::Error,
            Level::Warn => Verbosity::Warn,
            Level::Info => Verbosity::Help,
            Level::Debug | Level::Trace => Verbosity::Info,
        },
        None => Verbosity::Quiet,
    };
    let _ = VERBOSITY.set(verbose);

    let start = Instant::now();
    let input_name = format!("{}", args.input);

    // Includes resolve against the input file's directory; stdin (and bare
    // file names) resolve against the working directory.
    let dir: Option<PathBuf> = args
        .input
        .path()
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf());

    let mut text = String::new();
    args.input
        .read_to_string(&mut text)
        .map_err(|err| Errors::from(error!("failed to read input: {err}")))?;

    let mut out = args.output.lock();
    let assembly = match assemble_source(&text, dir.as_deref(), args.base) {
        Ok(assembly) => assembly,
        Err(errors) => {
            let _ = writeln!(out, "<FAILURE>");
            return Err(errors);
        }
    };

    if args.list {
        write!(out, "{}", listing::listing(&assembly.program))
            .map_err(|err| Errors::from(error!("failed to write listing: {err}")))?;
    }

    if args.debug {
        for chunk in assembly.image.chunks(16) {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
            writeln!(out, "{}", hex.join(" "))
                .map_err(|err| Errors::from(error!("failed to write hex dump: {err}")))?;
        }
    }

    writeln!(out, "{}", STANDARD.encode(&assembly.image))
        .map_err(|err| Errors::from(error!("failed to write to output: {err}")))?;
    drop(out);
    args.output
        .finish()
        .map_err(|err| Errors::from(error!("failed to finalize output: {err}")))?;

    let elapsed = start.elapsed().as_millis();
    let seconds = elapsed / 1000;
    let millis = elapsed % 1000;
    if verbose > Verbosity::Quiet {
        eprintln!(
            "    {} assembling `{}` in {seconds}.{millis:03}s",
            "Finished".green().bold(),
            input_name.trim_matches('"')
        );
    }

    Ok(())
}
