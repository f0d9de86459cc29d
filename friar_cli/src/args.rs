// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Command-line argument parsing.

use std::path::PathBuf;
use std::process;

const USAGE: &str = "\
Usage: friar [-h] [-t] [--mode=MODE] [--] <input>

  <input>       A path to the Lama bytecode file to interpret.

Options:
  -h, --help    Print this help message.

  -t, --time    Measure the execution time.

  --mode=MODE   Select the execution mode. Available choices:
                - disas: disassemble the bytecode and exit.
                - verify: only perform bytecode verification.
                - idiom: search for bytecode idioms.
                - run: execute the bytecode (default).";

/// The selected execution mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Disassemble the bytecode to stdout.
    Disas,
    /// Verify the bytecode and exit.
    Verify,
    /// Mine and print bytecode idioms.
    Idiom,
    /// Verify and execute the bytecode.
    Run,
}

/// Parsed command-line arguments.
#[derive(Clone, Debug)]
pub struct Args {
    /// The input bytecode file.
    pub input: PathBuf,
    /// The execution mode.
    pub mode: Mode,
    /// Measure and report per-stage execution time.
    pub time: bool,
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{msg}");
    eprintln!("{USAGE}");
    process::exit(2);
}

impl Args {
    /// Parses the process arguments, exiting with code 2 on usage errors.
    pub fn parse_or_exit() -> Self {
        let mut input: Option<PathBuf> = None;
        let mut mode = Mode::Run;
        let mut time = false;
        let mut positional_only = false;

        for arg in std::env::args().skip(1) {
            if !positional_only && arg == "--" {
                positional_only = true;
            } else if !positional_only && arg.starts_with('-') {
                if arg == "-h" || arg == "--help" {
                    eprintln!("{USAGE}");
                    process::exit(0);
                } else if arg == "-t" || arg == "--time" {
                    time = true;
                } else if let Some(rest) = arg.strip_prefix("--") {
                    let (name, value) = match rest.split_once('=') {
                        Some((name, value)) => (name, Some(value)),
                        None => (rest, None),
                    };
                    if name == "mode" {
                        let Some(value) = value else {
                            usage_error("--mode requires a value");
                        };
                        mode = match value {
                            "disas" => Mode::Disas,
                            "verify" => Mode::Verify,
                            "idiom" => Mode::Idiom,
                            "run" => Mode::Run,
                            other => {
                                usage_error(&format!("Unrecognized mode: {other}"));
                            }
                        };
                    } else {
                        usage_error(&format!("Unrecognized option: {arg}"));
                    }
                } else {
                    usage_error(&format!("Unrecognized option: {arg}"));
                }
            } else if input.is_none() {
                input = Some(PathBuf::from(arg));
            } else {
                usage_error(&format!("Unexpected positional argument: {arg}"));
            }
        }

        let Some(input) = input else {
            usage_error("No input path given.");
        };

        Self { input, mode, time }
    }
}
