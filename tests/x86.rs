//! End-to-end tracing of real x86-64 machine code through the built-in decoder.

use std::sync::Arc;

use symtrace::prelude::*;

// mov ebx, eax ; add ebx, 3 ; cmp ebx, 10 ; jl +0x10 ; push rbx
const CODE: [u8; 11] = [0x89, 0xC3, 0x83, 0xC3, 0x03, 0x83, 0xFB, 0x0A, 0x7C, 0x10, 0x53];

fn untainted_session(eax: u64) -> Result<(Arc<SimulatedDebuggee>, ExecutionCoordinator)> {
    let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86_64));
    debuggee.load(0x1000, &CODE)?;
    debuggee.map(0x7000, 0x1000)?;
    debuggee.set_register(Register::Rsp, 0x7800)?;
    debuggee.set_register(Register::Rax, eax)?;

    let mut coordinator = CoordinatorBuilder::new()
        .debuggee(debuggee.clone())
        .notifications(Arc::new(RecordingNotificationSource::new()))
        .operator(Arc::new(ScriptedOperator::new(SnapshotDecision::Skip)))
        .build()?;
    assert!(coordinator.activate());
    Ok((debuggee, coordinator))
}

fn session(eax: u64) -> Result<(Arc<SimulatedDebuggee>, ExecutionCoordinator)> {
    let (debuggee, mut coordinator) = untainted_session(eax)?;
    coordinator.taint_register(Register::Eax)?;
    Ok((debuggee, coordinator))
}

fn step(coordinator: &mut ExecutionCoordinator, pc: u64, next_pc: Option<u64>) -> NotificationOutcome {
    coordinator.handle_notification(DebuggerNotification::Step { pc, next_pc })
}

#[test]
fn test_decoded_comparison_triggers() -> Result<()> {
    let (debuggee, mut coordinator) = session(5)?;

    step(&mut coordinator, 0x1000, None);
    debuggee.set_register(Register::Rbx, 5)?;
    step(&mut coordinator, 0x1002, None);
    debuggee.set_register(Register::Rbx, 8)?;
    step(&mut coordinator, 0x1005, None);

    // No observed successor: the outcome comes from evaluating the predicate.
    let outcome = step(&mut coordinator, 0x1008, None);
    let NotificationOutcome::Processed {
        trigger: Some(trigger),
        ..
    } = outcome
    else {
        panic!("expected a trigger, got {outcome:?}");
    };
    assert!(trigger.taken);
    assert_eq!(trigger.condition, Condition::L);
    assert_eq!(trigger.target, 0x101a);
    assert_eq!(trigger.fallthrough, 0x100a);

    let state = coordinator.symbolic_state().expect("active session");
    let rbx = state.register(Register::Rbx).expect("rbx is symbolic");
    assert_eq!(rbx.expr.bits(), 64);
    assert_eq!(rbx.expr.evaluate(|_| Some(5)), Some(8));
    Ok(())
}

#[test]
fn test_decoded_push_journals_and_taints_stack() -> Result<()> {
    let (debuggee, mut coordinator) = session(20)?;
    step(&mut coordinator, 0x1000, Some(0x1002));
    debuggee.set_register(Register::Rbx, 20)?;
    let snapshot = coordinator.capture_snapshot()?;

    let outcome = step(&mut coordinator, 0x100a, Some(0x100b));
    assert!(matches!(outcome, NotificationOutcome::Processed { .. }));
    debuggee.write_memory(0x77f8, &20u64.to_le_bytes())?;
    debuggee.set_register(Register::Rsp, 0x77f8)?;

    let state = coordinator.symbolic_state().expect("active session");
    assert!(state.is_tainted(&Location::Memory {
        address: 0x77f8,
        size: 8
    }));
    assert!(state.register(Register::Rsp).is_none());

    coordinator.restore_snapshot(snapshot)?;
    assert_eq!(debuggee.read_memory(0x77f8, 8)?, vec![0; 8]);
    assert_eq!(debuggee.register(Register::Rsp)?, 0x7800);
    Ok(())
}

#[test]
fn test_undecodable_bytes_are_isolated() -> Result<()> {
    let (debuggee, mut coordinator) = session(5)?;
    // 0x06 (push es) is invalid in 64-bit mode.
    debuggee.load(0x2000, &[0x06])?;
    let outcome = step(&mut coordinator, 0x2000, None);
    assert!(matches!(
        outcome,
        NotificationOutcome::Isolated(Error::Undecodable { pc: 0x2000 })
    ));
    assert!(coordinator.is_active());
    Ok(())
}

fn expect_trigger(outcome: NotificationOutcome) -> TaintTrigger {
    match outcome {
        NotificationOutcome::Processed {
            trigger: Some(trigger),
            ..
        } => trigger,
        other => panic!("expected a trigger, got {other:?}"),
    }
}

#[test]
fn test_loop_counter_branch_uses_concrete_flags() -> Result<()> {
    let (debuggee, mut coordinator) = session(5)?;
    // mov ecx, eax ; dec ecx ; jg +0x10
    debuggee.load(0x2000, &[0x89, 0xC1, 0xFF, 0xC9, 0x7F, 0x10])?;

    step(&mut coordinator, 0x2000, None);
    debuggee.set_register(Register::Rcx, 5)?;
    step(&mut coordinator, 0x2002, None);
    debuggee.set_register(Register::Rcx, 4)?;
    debuggee.set_register(Register::Rflags, 0x202)?;

    let trigger = expect_trigger(step(&mut coordinator, 0x2004, None));
    assert_eq!(trigger.condition, Condition::G);
    assert!(trigger.taken);
    assert!(trigger.predicate.is_none());
    assert_eq!(trigger.successor(), 0x2016);
    Ok(())
}

#[test]
fn test_overflow_branch_uses_concrete_flags() -> Result<()> {
    let (debuggee, mut coordinator) = session(5)?;
    // add eax, 0x7fffffff ; jo +0x10
    debuggee.load(0x2100, &[0x05, 0xFF, 0xFF, 0xFF, 0x7F, 0x70, 0x10])?;

    step(&mut coordinator, 0x2100, None);
    debuggee.set_register(Register::Rax, 0x8000_0004)?;
    // SF | OF | PF
    debuggee.set_register(Register::Rflags, 0xa86)?;

    let trigger = expect_trigger(step(&mut coordinator, 0x2105, None));
    assert_eq!(trigger.condition, Condition::O);
    assert!(trigger.taken);
    assert_eq!(trigger.target, 0x2117);
    Ok(())
}

#[test]
fn test_zero_extended_input_byte_reaches_branch() -> Result<()> {
    let (debuggee, mut coordinator) = untainted_session(0)?;
    // movzx eax, byte [rsi] ; cmp eax, 0x41 ; jne +0x10
    debuggee.load(0x3000, &[0x0F, 0xB6, 0x06, 0x83, 0xF8, 0x41, 0x75, 0x10])?;
    debuggee.load(0x5000, b"A")?;
    debuggee.set_register(Register::Rsi, 0x5000)?;
    let input = coordinator.taint_memory(0x5000, 1)?;

    step(&mut coordinator, 0x3000, None);
    debuggee.set_register(Register::Rax, 0x41)?;
    let state = coordinator.symbolic_state().expect("active session");
    let rax = state.register(Register::Rax).expect("rax is symbolic");
    assert!(rax.tainted);
    assert_eq!(rax.expr.variables(), input);

    step(&mut coordinator, 0x3003, None);
    let trigger = expect_trigger(step(&mut coordinator, 0x3006, None));
    assert_eq!(trigger.condition, Condition::Ne);
    assert!(!trigger.taken);
    assert_eq!(trigger.successor(), 0x3008);
    let predicate = trigger.predicate.expect("comparison is expressible");
    assert_eq!(predicate.evaluate(|_| Some(0x42)), Some(1));
    Ok(())
}
