//! `vitte-cli` — the `vitte` command-line interpreter.
//!
//! With no script argument, reads and runs one line at a time from stdin
//! until EOF (a REPL). With one argument, compiles and runs that file.
//! Exit codes follow the convention set by the reference implementation's
//! `main.c`: `0` success, `65` compile error, `70` runtime error, `74` I/O
//! failure.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use vitte_vm::{InterpretResult, Vm, VmOptions};

pub const EXIT_OK: i32 = 0;
pub const EXIT_COMPILE_ERROR: i32 = 65;
pub const EXIT_RUNTIME_ERROR: i32 = 70;
pub const EXIT_IO_ERROR: i32 = 74;

#[derive(Parser, Debug)]
#[command(name = "vitte", version, about = "Vitte language interpreter")]
struct Cli {
    /// Script to execute. Omitted: start a REPL reading from stdin.
    script: Option<PathBuf>,

    /// Trace each executed instruction (emitted at `tracing::trace!` level;
    /// pair with `RUST_LOG=trace` to see it).
    #[arg(long)]
    trace: bool,

    /// Run a garbage collection before every allocation, to shake out
    /// rooting bugs.
    #[arg(long)]
    stress_gc: bool,

    /// Compile the script and print its disassembly instead of running it.
    #[arg(long)]
    disassemble: bool,
}

/// Parses arguments and runs the REPL or a script. Returns a process exit
/// code; never panics on user input.
pub fn run() -> i32 {
    let cli = Cli::parse();
    match &cli.script {
        None => run_repl(&cli),
        Some(path) => run_file(&cli, path),
    }
}

fn vm_options(cli: &Cli) -> VmOptions {
    VmOptions::default().with_trace(cli.trace).with_stress_gc(cli.stress_gc)
}

fn run_repl(cli: &Cli) -> i32 {
    let mut vm = Vm::with_options(vm_options(cli));
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        if stdout.flush().is_err() {
            return EXIT_IO_ERROR;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return EXIT_OK, // EOF
            Ok(_) => {
                // A REPL line's result is informational only — clox's own
                // REPL doesn't exit on a bad line, it just reports and loops.
                vm.interpret(&line);
            }
            Err(_) => return EXIT_IO_ERROR,
        }
    }
}

fn run_file(cli: &Cli, path: &Path) -> i32 {
    let source = match read_source(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("vitte: {e:?}");
            return EXIT_IO_ERROR;
        }
    };

    if cli.disassemble {
        return match vitte_vm::disassemble_program(&source) {
            Ok(text) => {
                print!("{text}");
                EXIT_OK
            }
            Err(errors) => {
                for e in &errors {
                    eprintln!("{e}");
                }
                EXIT_COMPILE_ERROR
            }
        };
    }

    let mut vm = Vm::with_options(vm_options(cli));
    match vm.interpret(&source) {
        InterpretResult::Ok => EXIT_OK,
        InterpretResult::CompileError => EXIT_COMPILE_ERROR,
        InterpretResult::RuntimeError => EXIT_RUNTIME_ERROR,
    }
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading script `{}`", path.display()))
}
