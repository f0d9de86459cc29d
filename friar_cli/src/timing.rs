// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `--time` measurement harness.

use std::io::Write as _;
use std::time::{Duration, Instant};

/// One named measurement.
#[derive(Copy, Clone, Debug)]
pub struct Measurement {
    /// The measured stage.
    pub name: &'static str,
    /// How long the stage took.
    pub elapsed: Duration,
}

/// A collection of stage timings, disabled unless `-t` was given.
#[derive(Debug)]
pub struct Timings {
    measurements: Vec<Measurement>,
    enabled: bool,
}

impl Timings {
    /// Creates a harness; when `enabled` is false, [`Timings::measure`] is a passthrough.
    pub fn new(enabled: bool) -> Self {
        Self {
            measurements: Vec::new(),
            enabled,
        }
    }

    /// Runs `f`, recording its wall time under `name`.
    pub fn measure<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        if !self.enabled {
            return f();
        }
        let start = Instant::now();
        let result = f();
        self.measurements.push(Measurement {
            name,
            elapsed: start.elapsed(),
        });
        result
    }

    /// Prints the recorded measurements to stderr.
    pub fn report(&self) {
        if !self.enabled {
            return;
        }
        let mut err = std::io::stderr().lock();
        for m in &self.measurements {
            let _ = writeln!(err, "{:<8} {:?}", m.name, m.elapsed);
        }
    }
}
