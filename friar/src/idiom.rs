// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bytecode idiom mining.
//!
//! An *idiom* is the byte span of one reachable instruction, or of two adjacent reachable
//! instructions that no control-flow boundary separates. The miner walks every instruction
//! reachable from the verified procedure entries, tallies idiom occurrences by bytewise span
//! equality, and reports them most frequent first.

use alloc::vec;
use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};

use crate::decode::{Capture, Decoder};
use crate::module::Module;
use crate::opcode::Opcode;
use crate::verifier::ModuleInfo;

/// One idiom and its occurrence count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Idiom<'a> {
    /// The instruction bytes (one instruction, or two adjacent ones).
    pub instrs: &'a [u8],
    /// How many times the byte span occurs among reachable instructions.
    pub occurrences: u32,
}

/// Instructions after which a pair must not be extended, beyond jump targets: the successor
/// executes in a different dynamic context (or not at all).
fn splits_after(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Jmp | Opcode::Call | Opcode::CallC | Opcode::Ret | Opcode::End | Opcode::Fail
    )
}

/// Visits every instruction reachable from the verified procedure entries.
///
/// Fall-through and jump successors are followed; terminators end the path. The module must
/// have verified against `info`.
fn walk_reachable(module: &Module, info: &ModuleInfo, mut visit: impl FnMut(Opcode, &Capture)) {
    let bc = &module.bytecode;
    let mut decoder = Decoder::new(bc);
    let mut pending: Vec<u32> = info.procs.keys().copied().collect();
    let mut seen = vec![false; bc.len()];

    while let Some(addr) = pending.pop() {
        let Some(flag) = seen.get_mut(addr as usize) else {
            continue;
        };
        if *flag {
            continue;
        }
        *flag = true;

        let cap = Capture::decode_at(&mut decoder, addr);
        if cap.error.is_some() {
            continue;
        }
        let Some(op) = Opcode::from_byte(cap.opcode) else {
            continue;
        };

        if op.is_jump() {
            pending.push(cap.imm(0).value);
        }
        visit(op, &cap);
        if !op.is_terminator() {
            pending.push(cap.end);
        }
    }
}

fn split_points(module: &Module, info: &ModuleInfo) -> HashSet<u32> {
    let mut split = HashSet::new();
    walk_reachable(module, info, |op, cap| {
        if op.is_jump() {
            // The (predecessor, target) pair must not be counted across the join.
            split.insert(cap.imm(0).value);
        }
        if splits_after(op) {
            split.insert(cap.end);
        }
    });
    split
}

/// Mines the idioms of a verified module, sorted by descending occurrence count with ties
/// broken by lexicographic instruction-byte order.
#[must_use]
pub fn find_idioms<'a>(module: &'a Module, info: &ModuleInfo) -> Vec<Idiom<'a>> {
    let bc: &'a [u8] = &module.bytecode;
    let split = split_points(module, info);

    let mut counts: HashMap<&'a [u8], u32> = HashMap::new();
    let mut pair_decoder = Decoder::new(bc);
    walk_reachable(module, info, |_op, cap| {
        let span = &bc[cap.start as usize..cap.end as usize];
        *counts.entry(span).or_insert(0) += 1;

        if !split.contains(&cap.end) && (cap.end as usize) < bc.len() {
            let next = Capture::decode_at(&mut pair_decoder, cap.end);
            if next.error.is_none() {
                let pair = &bc[cap.start as usize..next.end as usize];
                *counts.entry(pair).or_insert(0) += 1;
            }
        }
    });

    let mut idioms: Vec<Idiom<'a>> = counts
        .into_iter()
        .map(|(instrs, occurrences)| Idiom {
            instrs,
            occurrences,
        })
        .collect();
    idioms.sort_unstable_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.instrs.cmp(b.instrs))
    });
    idioms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Asm;
    use crate::verifier::verify;

    fn count_of(idioms: &[Idiom<'_>], bytes: &[u8]) -> Option<u32> {
        idioms
            .iter()
            .find(|i| i.instrs == bytes)
            .map(|i| i.occurrences)
    }

    #[test]
    fn counts_singles_and_adjacent_pairs() {
        let mut a = Asm::new();
        a.begin(2, 0);
        a.const_(1);
        a.const_(2);
        a.add();
        a.const_(1);
        a.const_(2);
        a.add();
        a.ret();
        let m = a.build("t", 0).unwrap();
        let info = verify(&m).unwrap();
        let idioms = find_idioms(&m, &info);

        let const1 = [Opcode::Const as u8, 1, 0, 0, 0];
        let const2 = [Opcode::Const as u8, 2, 0, 0, 0];
        let add = [Opcode::Add as u8];
        let pair: Vec<u8> = const1.iter().chain(&const2).copied().collect();

        assert_eq!(count_of(&idioms, &add), Some(2));
        assert_eq!(count_of(&idioms, &const1), Some(2));
        assert_eq!(count_of(&idioms, &pair), Some(2));
        assert_eq!(count_of(&idioms, &[Opcode::Ret as u8]), Some(1));

        // Descending counts, ties by byte order: the lone `add` byte sorts first among the
        // count-2 idioms.
        assert_eq!(idioms[0].occurrences, 2);
        assert_eq!(idioms[0].instrs, add);
        let counts: Vec<u32> = idioms.iter().map(|i| i.occurrences).collect();
        let mut sorted = counts.clone();
        sorted.sort_unstable_by(|x, y| y.cmp(x));
        assert_eq!(counts, sorted);
    }

    #[test]
    fn jump_targets_split_pairs() {
        let mut a = Asm::new();
        let l = a.label();
        a.begin(2, 0);
        a.const_(1);
        a.cjmpz(l);
        a.bind(l);
        a.const_(0);
        a.end();
        let m = a.build("t", 0).unwrap();
        let info = verify(&m).unwrap();
        let idioms = find_idioms(&m, &info);

        // The cjmpz's fall-through successor is also its jump target, so no pair may span it.
        assert!(
            idioms
                .iter()
                .all(|i| i.instrs[0] != Opcode::CjmpZ as u8 || i.instrs.len() == 5)
        );
    }

    #[test]
    fn terminal_instructions_do_not_extend_pairs() {
        let mut a = Asm::new();
        a.begin(2, 0);
        a.const_(0);
        a.end();
        a.begin(3, 0);
        a.const_(0);
        a.end();
        let m = a.build("t", 0).unwrap();
        let info = verify(&m).unwrap();
        let idioms = find_idioms(&m, &info);

        // No pair may span the END/BEGIN procedure boundary or reach the EOF marker.
        assert!(
            idioms
                .iter()
                .all(|i| i.instrs[0] != Opcode::End as u8 || i.instrs.len() == 1)
        );
        assert_eq!(count_of(&idioms, &[Opcode::End as u8]), Some(2));
    }
}
