// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `friar` command-line driver.
//!
//! Wires the core pipeline to the filesystem and the standard streams. Exit codes: 0 on
//! success, 1 on load/verification/runtime failures (diagnostic on stderr), 2 on usage errors.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::process::ExitCode;

use anyhow::{Context, anyhow};
use friar::disasm::{self, DisasmOpts};
use friar::vm::{Interp, RunError};
use friar::{idiom, loader, verifier};

mod args;
mod console;
mod timing;

use args::{Args, Mode};
use console::StdConsole;
use timing::Timings;

fn main() -> ExitCode {
    let args = Args::parse_or_exit();
    let mut timings = Timings::new(args.time);
    let result = run(&args, &mut timings);
    timings.report();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, timings: &mut Timings) -> anyhow::Result<()> {
    let bytes = timings
        .measure("read", || fs::read(&args.input))
        .with_context(|| format!("cannot read {}", args.input.display()))?;

    let name = args.input.file_stem().map_or_else(
        || String::from("module"),
        |stem| stem.to_string_lossy().into_owned(),
    );
    let module = timings
        .measure("load", || loader::load(&name, &bytes))
        .map_err(|e| anyhow!("{name}: at byte {:#x}: {e}", e.offset))?;

    match args.mode {
        Mode::Disas => {
            let text = disasm::disassemble(
                &module.bytecode,
                &DisasmOpts {
                    print_addr: true,
                    instr_sep: "\n",
                },
            );
            println!("{text}");
            Ok(())
        }

        Mode::Verify => {
            timings
                .measure("verify", || verifier::verify(&module))
                .map_err(|e| anyhow!("{name}: at {:#x}: {e}", e.addr))?;
            Ok(())
        }

        Mode::Idiom => {
            let info = timings
                .measure("verify", || verifier::verify(&module))
                .map_err(|e| anyhow!("{name}: at {:#x}: {e}", e.addr))?;
            let idioms = timings.measure("idiom", || idiom::find_idioms(&module, &info));

            let opts = DisasmOpts {
                print_addr: false,
                instr_sep: "; ",
            };
            let mut out = io::stdout().lock();
            for i in &idioms {
                writeln!(
                    out,
                    "{:>8}  {}",
                    i.occurrences,
                    disasm::disassemble(i.instrs, &opts)
                )
                .context("cannot write to stdout")?;
            }
            Ok(())
        }

        Mode::Run => {
            let info = timings
                .measure("verify", || verifier::verify(&module))
                .map_err(|e| anyhow!("{name}: at {:#x}: {e}", e.addr))?;
            let mut console = StdConsole::new();
            let mut interp = Interp::new(&module, &info, &mut console);
            timings
                .measure("run", || interp.run())
                .map_err(|e| render_run_error(&e))?;
            Ok(())
        }
    }
}

fn render_run_error(e: &RunError) -> anyhow::Error {
    let mut msg = e.to_string();
    for frame in &e.backtrace.entries {
        let name = frame
            .proc_name
            .clone()
            .unwrap_or_else(|| format!("<proc {:#x}>", frame.proc_addr));
        let _ = write!(
            msg,
            "\n  at {}:{} in {name} (pc {:#x})",
            frame.file, frame.line, frame.pc
        );
    }
    anyhow!(msg)
}
