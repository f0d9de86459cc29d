// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Criterion benchmarks for the friar verifier and interpreter live in `benches/`.
