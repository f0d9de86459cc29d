// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The stdin/stdout console for interpreter I/O.

use std::io::{self, BufRead, Write};

use friar::vm::{Console, ConsoleError};

/// A [`Console`] over the process's standard streams.
///
/// `read_int` prompts with `" > "` and reads the next whitespace-delimited token from stdin,
/// buffering one line at a time.
#[derive(Debug, Default)]
pub struct StdConsole {
    buf: String,
    pos: usize,
}

impl StdConsole {
    /// Creates a console with an empty input buffer.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&mut self) -> Result<&str, ConsoleError> {
        loop {
            let rest = &self.buf[self.pos..];
            if let Some(i) = rest.find(|c: char| !c.is_whitespace()) {
                let start = self.pos + i;
                let end = self.buf[start..]
                    .find(char::is_whitespace)
                    .map_or(self.buf.len(), |j| start + j);
                self.pos = end;
                return Ok(&self.buf[start..end]);
            }

            self.buf.clear();
            self.pos = 0;
            let n = io::stdin()
                .lock()
                .read_line(&mut self.buf)
                .map_err(|_| ConsoleError::Io)?;
            if n == 0 {
                return Err(ConsoleError::Eof);
            }
        }
    }
}

impl Console for StdConsole {
    fn read_int(&mut self) -> Result<isize, ConsoleError> {
        let mut out = io::stdout().lock();
        write!(out, " > ")
            .and_then(|()| out.flush())
            .map_err(|_| ConsoleError::Io)?;
        drop(out);

        self.next_token()?
            .parse::<isize>()
            .map_err(|_| ConsoleError::Malformed)
    }

    fn write_int(&mut self, value: isize) -> Result<(), ConsoleError> {
        let mut out = io::stdout().lock();
        writeln!(out, "{value}").map_err(|_| ConsoleError::Io)
    }
}
