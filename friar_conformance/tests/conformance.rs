// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![allow(missing_docs, reason = "integration test crate")]

use std::sync::Mutex;

use friar::asm::Asm;
use friar::decode::VarKind;
use friar::idiom::find_idioms;
use friar::loader;
use friar::module::Module;
use friar::opcode::Opcode;
use friar::trace::{TraceEvent, TraceMask, TraceSink};
use friar::verifier::{VerifyErrorKind, verify};
use friar::vm::{Console, ConsoleError, Interp, RunError, RunErrorKind};

/// The interpreter rejects concurrent activations process-wide, so tests that execute bytecode
/// serialize on this lock.
static VM_LOCK: Mutex<()> = Mutex::new(());

#[derive(Default)]
struct Script {
    inputs: Vec<isize>,
    pos: usize,
    output: String,
}

impl Console for Script {
    fn read_int(&mut self) -> Result<isize, ConsoleError> {
        let Some(&v) = self.inputs.get(self.pos) else {
            return Err(ConsoleError::Eof);
        };
        self.pos += 1;
        Ok(v)
    }

    fn write_int(&mut self, value: isize) -> Result<(), ConsoleError> {
        use std::fmt::Write as _;
        writeln!(self.output, "{value}").map_err(|_| ConsoleError::Io)
    }
}

fn run_with_inputs(module: &Module, inputs: &[isize]) -> (Result<(), RunError>, String) {
    let info = verify(module).expect("module must verify");
    let mut console = Script {
        inputs: inputs.to_vec(),
        ..Script::default()
    };
    let guard = VM_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let result = Interp::new(module, &info, &mut console).run();
    drop(guard);
    (result, console.output)
}

fn run_ok(module: &Module, inputs: &[isize]) -> String {
    let (result, output) = run_with_inputs(module, inputs);
    result.expect("program must run to completion");
    output
}

#[test]
fn prints_a_constant() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(42);
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "42\n");
}

#[test]
fn locals_load_and_store() {
    let mut a = Asm::new();
    a.begin(2, 1);
    a.const_(1);
    a.st(VarKind::Local, 0);
    a.drop_();
    a.ld(VarKind::Local, 0);
    a.ld(VarKind::Local, 0);
    a.add();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "2\n");
}

#[test]
fn globals_load_and_store() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(5);
    a.st(VarKind::Global, 0);
    a.drop_();
    a.ld(VarKind::Global, 0);
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 1).unwrap();

    assert_eq!(run_ok(&m, &[]), "5\n");
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(10);
    a.const_(0);
    a.div();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    let (result, output) = run_with_inputs(&m, &[]);
    let err = result.unwrap_err();
    assert_eq!(err.kind, RunErrorKind::DivisionByZero);
    assert_eq!(err.backtrace.entries.len(), 1);
    assert_eq!(err.backtrace.entries[0].file, "t");
    assert_eq!(output, "");
}

#[test]
fn conditional_branches_take_the_right_arm() {
    let mut a = Asm::new();
    let l1 = a.label();
    let l2 = a.label();
    a.begin(2, 0);
    a.const_(1);
    a.const_(2);
    a.lt();
    a.cjmpz(l1);
    a.const_(100);
    a.lwrite();
    a.drop_();
    a.jmp(l2);
    a.bind(l1);
    a.const_(200);
    a.lwrite();
    a.drop_();
    a.bind(l2);
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "100\n");
}

#[test]
fn direct_call_to_cbegin_fails_verification() {
    let mut a = Asm::new();
    let p = a.label();
    a.begin(2, 0);
    a.call(p, 0);
    a.drop_();
    a.const_(0);
    a.end();
    a.bind(p);
    a.cbegin(0, 0);
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    let err = verify(&m).unwrap_err();
    assert!(matches!(err.kind, VerifyErrorKind::CallToClosure { .. }));
}

#[test]
fn empty_bytecode_has_no_main() {
    let m = Module {
        name: "t".into(),
        global_count: 0,
        symtab: vec![],
        strtab: vec![],
        bytecode: vec![Opcode::Eof as u8],
    };
    assert_eq!(verify(&m).unwrap_err().kind, VerifyErrorKind::NoMain);
}

#[test]
fn call_to_a_non_procedure_fails_verification() {
    let mut a = Asm::new();
    let mid = a.label();
    a.begin(2, 0);
    a.call(mid, 0);
    a.drop_();
    a.bind(mid);
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert!(matches!(
        verify(&m).unwrap_err().kind,
        VerifyErrorKind::CallNotProc { .. }
    ));
}

#[test]
fn recursive_calls_compute_a_factorial() {
    let mut a = Asm::new();
    let f = a.label();
    let base_case = a.label();
    let done = a.label();
    a.begin(2, 0);
    a.const_(5);
    a.call(f, 1);
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    a.bind(f);
    a.begin(1, 0);
    a.ld(VarKind::Param, 0);
    a.cjmpz(base_case);
    a.ld(VarKind::Param, 0);
    a.ld(VarKind::Param, 0);
    a.const_(1);
    a.sub();
    a.call(f, 1);
    a.mul();
    a.jmp(done);
    a.bind(base_case);
    a.const_(1);
    a.bind(done);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "120\n");
}

#[test]
fn closures_capture_locals_and_take_arguments() {
    let mut a = Asm::new();
    let p = a.label();
    a.begin(2, 1);
    a.const_(10);
    a.st(VarKind::Local, 0);
    a.drop_();
    a.closure(p, &[(VarKind::Local, 0)]);
    a.const_(5);
    a.callc(1);
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    a.bind(p);
    a.cbegin(1, 0);
    a.ld(VarKind::Param, 0);
    a.ld(VarKind::Capture, 0);
    a.add();
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "15\n");
}

#[test]
fn calling_a_non_closure_is_a_runtime_error() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(3);
    a.const_(5);
    a.callc(1);
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    let (result, _) = run_with_inputs(&m, &[]);
    assert_eq!(
        result.unwrap_err().kind,
        RunErrorKind::NotCallable { got: "integer" }
    );
}

#[test]
fn reads_integers_from_the_console() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.lread();
    a.lread();
    a.add();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[7, 35]), "42\n");
}

#[test]
fn arrays_support_elem_and_sta() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(10);
    a.const_(20);
    a.const_(30);
    a.barray(3);
    a.dup();
    a.const_(1);
    a.elem();
    a.lwrite();
    a.drop_();
    a.dup();
    a.const_(0);
    a.const_(99);
    a.sta();
    a.drop_();
    a.const_(0);
    a.elem();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "20\n99\n");
}

#[test]
fn out_of_range_indices_fail() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(1);
    a.barray(1);
    a.const_(3);
    a.elem();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    let (result, _) = run_with_inputs(&m, &[]);
    assert_eq!(
        result.unwrap_err().kind,
        RunErrorKind::IndexOutOfRange { index: 3, len: 1 }
    );
}

#[test]
fn sexp_tags_and_patterns() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(1);
    a.const_(2);
    a.sexp("cons", 2);
    a.dup();
    a.tag("cons", 2);
    a.lwrite();
    a.drop_();
    a.dup();
    a.tag("cons", 3);
    a.lwrite();
    a.drop_();
    a.dup();
    a.tag("nil", 2);
    a.lwrite();
    a.drop_();
    a.patt_sexp();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "1\n0\n0\n1\n");
}

#[test]
fn string_patterns_and_length() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.string("hello");
    a.llength();
    a.lwrite();
    a.drop_();
    a.string("a");
    a.string("a");
    a.patt_eq_str();
    a.lwrite();
    a.drop_();
    a.string("a");
    a.patt_string();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.patt_val();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "5\n1\n1\n1\n");
}

#[test]
fn lstring_renders_aggregates() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(1);
    a.const_(2);
    a.sexp("cons", 2);
    a.lstring();
    a.llength();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    // `Lstring` renders the sexp as `cons (1, 2)`, which is 11 bytes long.
    assert_eq!(run_ok(&m, &[]), "11\n");
}

#[test]
fn fail_reports_the_scrutinee_with_coordinates() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(1);
    a.const_(2);
    a.sexp("cons", 2);
    a.fail(3, 7);
    let m = a.build("t", 0).unwrap();

    let (result, _) = run_with_inputs(&m, &[]);
    assert_eq!(
        result.unwrap_err().kind,
        RunErrorKind::MatchFailure {
            scrutinee: "cons (1, 2)".into(),
            line: 3,
            col: 7,
        }
    );
}

#[test]
fn equality_compares_across_kinds() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(1);
    a.string("x");
    a.eq();
    a.lwrite();
    a.drop_();
    a.const_(3);
    a.const_(3);
    a.eq();
    a.lwrite();
    a.drop_();
    a.string("x");
    a.dup();
    a.eq();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    assert_eq!(run_ok(&m, &[]), "0\n1\n1\n");
}

#[test]
fn backtraces_carry_lines_and_symbol_names() {
    let mut a = Asm::new();
    let f = a.label();
    let main = a.label();
    a.bind(main);
    a.begin(2, 0);
    a.line(1);
    a.call(f, 0);
    a.drop_();
    a.const_(0);
    a.end();
    a.bind(f);
    a.begin(0, 0);
    a.line(10);
    a.const_(1);
    a.const_(0);
    a.div();
    a.end();
    a.export("main", main);
    a.export("f", f);
    let m = a.build("t", 0).unwrap();

    let (result, _) = run_with_inputs(&m, &[]);
    let err = result.unwrap_err();
    assert_eq!(err.kind, RunErrorKind::DivisionByZero);

    let entries = &err.backtrace.entries;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].proc_name.as_deref(), Some("f"));
    assert_eq!(entries[0].line, 10);
    assert_eq!(entries[1].proc_name.as_deref(), Some("main"));
    assert_eq!(entries[1].line, 1);
    assert!(entries.iter().all(|e| e.file == "t"));
}

#[test]
fn idioms_count_pairs_across_a_straight_line_body() {
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

    let add = [Opcode::Add as u8];
    let pair = [
        Opcode::Const as u8,
        1,
        0,
        0,
        0,
        Opcode::Const as u8,
        2,
        0,
        0,
        0,
    ];
    let occurrences = |bytes: &[u8]| {
        idioms
            .iter()
            .find(|i| i.instrs == bytes)
            .map(|i| i.occurrences)
    };

    assert_eq!(occurrences(&add), Some(2));
    assert_eq!(occurrences(&pair), Some(2));
    assert_eq!(idioms[0].occurrences, 2);
    let counts: Vec<u32> = idioms.iter().map(|i| i.occurrences).collect();
    assert!(counts.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn loader_and_verifier_agree_end_to_end() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(42);
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let built = a.build("t", 3).unwrap();

    // Serialize the module into the on-disk layout and load it back.
    let mut file = Vec::new();
    file.extend_from_slice(&u32::try_from(built.strtab.len()).unwrap().to_le_bytes());
    file.extend_from_slice(&built.global_count.to_le_bytes());
    file.extend_from_slice(&u32::try_from(built.symtab.len()).unwrap().to_le_bytes());
    for sym in &built.symtab {
        file.extend_from_slice(&sym.address.to_le_bytes());
        file.extend_from_slice(&sym.name_offset.to_le_bytes());
    }
    file.extend_from_slice(&built.strtab);
    file.extend_from_slice(&built.bytecode);

    let loaded = loader::load("t", &file).unwrap();
    assert_eq!(loaded, built);
    assert_eq!(verify(&loaded).unwrap(), verify(&built).unwrap());
    assert_eq!(run_ok(&loaded, &[]), "42\n");
}

#[derive(Default)]
struct CountingSink {
    instrs: u32,
    enters: u32,
    exits: u32,
}

impl TraceSink for CountingSink {
    fn mask(&self) -> TraceMask {
        TraceMask::INSTR | TraceMask::CALL
    }

    fn event(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::Instr { .. } => self.instrs += 1,
            TraceEvent::FrameEnter { .. } => self.enters += 1,
            TraceEvent::FrameExit { .. } => self.exits += 1,
        }
    }
}

#[test]
fn tracing_reports_instructions_and_frames() {
    let mut a = Asm::new();
    let f = a.label();
    a.begin(2, 0);
    a.call(f, 0);
    a.drop_();
    a.const_(0);
    a.end();
    a.bind(f);
    a.begin(0, 0);
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();
    let info = verify(&m).unwrap();

    let mut console = Script::default();
    let mut sink = CountingSink::default();
    let guard = VM_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    Interp::new(&m, &info, &mut console)
        .run_traced(Some(&mut sink))
        .unwrap();
    drop(guard);

    // main: begin, call, drop, const, end; f: begin, const, end.
    assert_eq!(sink.instrs, 8);
    assert_eq!(sink.enters, 2);
    assert_eq!(sink.exits, 2);
}

#[test]
fn arithmetic_results_stay_well_formed_integers() {
    let mut a = Asm::new();
    a.begin(2, 0);
    a.const_(i32::MAX);
    a.const_(i32::MAX);
    a.mul();
    a.dup();
    a.eq();
    a.lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = a.build("t", 0).unwrap();

    // Whatever the product wraps to, it is a tagged integer that compares equal to itself.
    assert_eq!(run_ok(&m, &[]), "1\n");
}
