mod assembler;
mod diagnostic;
mod disasm;
mod emulator;
#[cfg(test)]
mod tests;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use env_logger::Env;
use shadow_rs::shadow;

shadow!(build);

/// Program creation for the TI MSP430.
#[derive(Parser, Debug)]
#[command(name = "m430", author, version = build::CLAP_LONG_VERSION, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    verbosity: Verbosity<WarnLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assemble MSP430 source into a program image.
    Asm(assembler::AssemblerArgs),
    /// Execute a program image.
    Run(emulator::EmulatorArgs),
    /// Disassemble a program image.
    Dasm(disasm::DasmArgs),
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Asm(args) => match assembler::assemble(args, cli.verbosity) {
            Ok(()) => 0,
            Err(errors) => {
                for err in &errors {
                    err.force_emit();
                }
                1
            }
        },
        Command::Run(args) => match emulator::emulate(args) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("{err}");
                1
            }
        },
        Command::Dasm(args) => match disasm::dump(args) {
            Ok(()) => 0,
            Err(err) => {
                err.force_emit();
                1
            }
        },
    };

    std::process::exit(code);
}
