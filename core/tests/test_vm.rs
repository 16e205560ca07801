//! Integration tests for the virtual machine: whole programs assembled
//! from source and executed to their final trap.

use nn::asm::assemble::assemble;
use nn::vm::{Machine, Trap};

fn run(src: &str) -> Machine {
    let image = assemble(src, "test.nnasm").expect("assembly failed");
    let mut machine = Machine::load(&image).expect("load failed");
    let trap = machine.run();
    assert_eq!(trap, Trap::Halt, "expected a clean halt");
    machine
}

#[test]
fn test_countdown_loop() {
    // Sum 1..=5 by counting down
    let machine = run(
        "MOV 5 $r0
         LBL top
         ADD $r0 $r1
         DEC $r0
         CNZR $r0
         JCH top
         HLT",
    );
    assert_eq!(machine.registers()["r1"], 15);
}

#[test]
fn test_call_stack_discipline() {
    // Nested calls return in order; $sp comes back to its start
    let machine = run(
        "CALL outer
         HLT
         LBL outer
         MOV 1 $r0
         CALL inner
         MOV 3 $r2
         RET
         LBL inner
         MOV 2 $r1
         RET",
    );
    assert_eq!(machine.registers()["r0"], 1);
    assert_eq!(machine.registers()["r1"], 2);
    assert_eq!(machine.registers()["r2"], 3);
}

#[test]
fn test_data_access_and_output() {
    let machine = run(
        "DBS msg \"sum=\"
         MOV msg $r0
         MOV ~msg $r1
         BTIN 0
         HLT",
    );
    assert_eq!(machine.output(), b"sum=");
}

#[test]
fn test_casts() {
    let machine = run(
        "MOV -9s $r0_s
         CSTD $r0_s $f0
         DDIV 2.0 $f0
         CDTS $f0 $r1_s
         HLT",
    );
    assert_eq!(machine.registers()["r1"] as i64, -4); // -9.0 / 2.0 → -4.5 → -4
}

#[test]
fn test_stack_data() {
    let machine = run(
        "MOV 11 $r0
         PUSH $r0
         MOV 22 $r0
         PUSH $r0
         POP $r1
         POP $r2
         HLT",
    );
    assert_eq!(machine.registers()["r1"], 22);
    assert_eq!(machine.registers()["r2"], 11);
}

#[test]
fn test_error_traps_have_spec_codes() {
    let cases: &[(&str, Trap, i64)] = &[
        ("LOAD [0xFFFFFFFFF] $r0 HLT", Trap::IllegalRead, 1),
        ("STOR $r0 [0] HLT", Trap::IllegalWrite, 2),
        ("POP $r0 HLT", Trap::StackUnderflow, 4),
        ("JMP 7 HLT", Trap::IllegalJump, 5),
        ("BTIN 500 HLT", Trap::IllegalBtin, 6),
    ];
    for (src, expected, code) in cases {
        let image = assemble(src, "t").unwrap();
        let mut machine = Machine::load(&image).unwrap();
        let trap = machine.run();
        assert_eq!(trap, *expected, "for `{}`", src);
        assert_eq!(trap.code(), *code);
        assert!(trap.is_error());
    }
    assert_eq!(Trap::Halt.code(), -2);
    assert_eq!(Trap::Break.code(), -1);
    assert!(!Trap::Halt.is_error());
}

#[test]
fn test_vm_is_deterministic() {
    let src = "MOV 1 $r0
               MOV 20 $r1
               LBL top
               MUL 3 $r0
               MOD 1000003 $r0
               DEC $r1
               CNZR $r1
               JCH top
               HLT";
    let image = assemble(src, "t").unwrap();
    let mut a = Machine::load(&image).unwrap();
    let mut b = Machine::load(&image).unwrap();
    assert_eq!(a.run(), b.run());
    assert_eq!(a.registers(), b.registers());
    assert_eq!(a.steps(), b.steps());
    assert_eq!(a.output(), b.output());
}

#[test]
fn test_break_then_resume_is_an_orderly_stop() {
    let image = assemble("BRK HLT", "t").unwrap();
    let mut machine = Machine::load(&image).unwrap();
    assert_eq!(machine.run(), Trap::Break);
}
