// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end conformance tests for the friar core live in `tests/`.
