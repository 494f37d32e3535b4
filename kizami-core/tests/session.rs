//! 実際に子プロセスを起動するテスト
//!
//! ptrace の権限と GNU binutils が必要なため、既定では実行しません。
//! `cargo test -- --ignored` で実行します。

use kizami_core::{
    Authorizer, BinutilsAssembler, CommandError, Engine, EngineState, LifecycleState,
    RegisterLocation, Session, StopOutcome, Syntax, YamaAuthorizer,
};
use kizami_target::registers::PC_INDEX;
use kizami_target::TRAP_BYTE;
use std::thread;
use std::time::Duration;

fn engine() -> Engine {
    let session = Session::bootstrap(&YamaAuthorizer::new()).expect("bootstrap");
    Engine::new(session, Box::new(BinutilsAssembler::default()), Syntax::Intel)
}

fn byte_at_pc(engine: &Engine) -> u8 {
    let pc = engine.session().pc().unwrap();
    engine.session().read_memory(pc, 1).unwrap()[0]
}

fn eax(engine: &Engine) -> u64 {
    engine.session().snapshot().unwrap().general[0] & 0xffff_ffff
}

fn step(engine: &mut Engine, source: &str) -> u64 {
    let step = engine.execute(source).unwrap();
    engine.finish_step();
    match step.outcome {
        StopOutcome::Trapped { pc } => pc,
        other => panic!("Expected trap, got {:?}", other),
    }
}

struct Deny;

impl Authorizer for Deny {
    fn authorize(&self) -> kizami_core::Result<()> {
        anyhow::bail!("denied")
    }
}

#[test]
fn test_bootstrap_requires_authorization() {
    // 権限確認に失敗したら fork しない
    let error = Session::bootstrap(&Deny).err().unwrap();
    assert!(format!("{:#}", error).contains("denied"));
}

#[test]
#[ignore]
fn test_bootstrap_parks_at_scratch_base() {
    let engine = engine();
    let session = engine.session();
    let scratch = session.scratch();
    assert_eq!(session.pc().unwrap(), scratch.base);
    assert_eq!(byte_at_pc(&engine), TRAP_BYTE);
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(session.is_listening());
}

#[test]
#[ignore]
fn test_nop_advances_only_pc() {
    let mut engine = engine();
    let before = engine.session().snapshot().unwrap();

    let pc = step(&mut engine, "nop");
    assert_eq!(pc, before.pc() + 1);

    let after = engine.session().snapshot().unwrap();
    for (index, (old, new)) in before.general.iter().zip(after.general.iter()).enumerate() {
        if index != PC_INDEX {
            assert_eq!(old, new, "register {} changed", index);
        }
    }
    assert_eq!(before.vector, after.vector);
}

#[test]
#[ignore]
fn test_step_monotonicity_and_idle_trap() {
    let mut engine = engine();
    let start = engine.session().pc().unwrap();

    // mov eax, imm32 は5バイト、xor eax, eax は2バイト
    let pc = step(&mut engine, "mov eax, 1");
    assert_eq!(pc, start + 5);
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(byte_at_pc(&engine), TRAP_BYTE);
    assert_eq!(engine.session().snapshot().unwrap().general[0] & 0xffff_ffff, 1);

    let pc = step(&mut engine, "xor eax, eax");
    assert_eq!(pc, start + 7);
    assert_eq!(byte_at_pc(&engine), TRAP_BYTE);

    let snapshot = engine.session().snapshot().unwrap();
    assert_eq!(snapshot.general[0], 0);
    let zf = kizami_target::flags::find("ZF").unwrap();
    assert_eq!(snapshot.flag(zf), 1);
}

#[test]
#[ignore]
fn test_invalid_mnemonic_changes_nothing() {
    let mut engine = engine();
    let before = engine.session().snapshot().unwrap();

    let error = engine.execute("notaninstruction").err().unwrap();
    assert!(matches!(
        error.downcast_ref::<CommandError>(),
        Some(CommandError::Assemble(_))
    ));
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(engine.session().snapshot().unwrap(), before);
    assert_eq!(byte_at_pc(&engine), TRAP_BYTE);
}

#[test]
#[ignore]
fn test_memory_round_trip_in_scratch() {
    let engine = engine();
    let address = engine.session().scratch().base + 0x100;
    let data = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
    engine.session().write_memory(address, &data).unwrap();
    assert_eq!(engine.session().read_memory(address, data.len()).unwrap(), data);
}

#[test]
#[ignore]
fn test_register_round_trip() {
    let engine = engine();
    let mut snapshot = engine.session().snapshot().unwrap();
    snapshot
        .assign(RegisterLocation::resolve("rbx").unwrap(), &[0x12, 0x34])
        .unwrap();
    snapshot
        .assign(RegisterLocation::resolve("xmm3").unwrap(), &[0xaa, 0xbb, 0xcc])
        .unwrap();
    engine.session().write_snapshot(&snapshot).unwrap();

    let reread = engine.session().snapshot().unwrap();
    assert_eq!(reread.general[1], 0x1234);
    assert_eq!(reread.vector[3].lanes, [0, 0xaabbcc]);
}

#[test]
#[ignore]
fn test_alloc_returns_fresh_writable_block() {
    let mut engine = engine();
    let pc = engine.session().pc().unwrap();
    let scratch = engine.session().scratch();

    let first = engine.session_mut().allocate(16).unwrap();
    let second = engine.session_mut().allocate(16).unwrap();
    assert!(!scratch.contains(first));
    assert!(!scratch.contains(second));
    assert_ne!(first, second);

    engine.session().write_memory(first, b"hello\0").unwrap();
    assert_eq!(engine.session().read_memory(first, 6).unwrap(), b"hello\0");

    // 確保の前後でPCとトラップは変わらない
    assert_eq!(engine.session().pc().unwrap(), pc);
    assert_eq!(byte_at_pc(&engine), TRAP_BYTE);
}

#[test]
#[ignore]
fn test_exit_syscall_ends_session() {
    let mut engine = engine();
    let step = engine.execute("mov eax, 60").unwrap();
    assert!(matches!(step.outcome, StopOutcome::Trapped { .. }));
    engine.finish_step();
    engine.execute("xor edi, edi").unwrap();
    engine.finish_step();
    let step = engine.execute("syscall").unwrap();
    assert_eq!(step.outcome, StopOutcome::Exited(0));
}

#[test]
#[ignore]
fn test_interrupt_while_running_rearms_trap() {
    let mut engine = engine();
    let pause = engine.session().pause_control();

    // 実行が始まるまで割り込みは受け付けられない
    let interrupter = thread::spawn(move || loop {
        if pause.request_pause().unwrap() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    });

    let paused = engine.execute("jmp $").unwrap();
    interrupter.join().unwrap();
    assert!(matches!(paused.outcome, StopOutcome::Paused { .. }));
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(byte_at_pc(&engine), TRAP_BYTE);
    engine.finish_step();

    step(&mut engine, "mov eax, 7");
    assert_eq!(eax(&engine), 7);
}

#[test]
#[ignore]
fn test_interrupt_while_idle_is_ignored() {
    let mut engine = engine();
    let pause = engine.session().pause_control();
    assert!(!pause.request_pause().unwrap());

    // 次の命令は割り込まれずにトラップまで進む
    step(&mut engine, "mov eax, 7");
    assert_eq!(eax(&engine), 7);
}

#[test]
#[ignore]
fn test_fault_signal_is_fatal() {
    let mut engine = engine();
    let error = engine.execute("mov rax, qword ptr [0]").err().unwrap();
    assert!(error.downcast_ref::<CommandError>().is_none());
    assert!(format!("{:#}", error).contains("SIGSEGV"));
    assert_eq!(engine.session().state(), LifecycleState::Exited);
}

#[test]
#[ignore]
fn test_failed_alloc_keeps_trap() {
    let mut engine = engine();
    let pc = engine.session().pc().unwrap();

    // 長さ0の mmap は EINVAL
    let error = engine.session_mut().allocate(0).err().unwrap();
    assert!(matches!(
        error.downcast_ref::<CommandError>(),
        Some(CommandError::Memory(_))
    ));
    assert_eq!(engine.session().pc().unwrap(), pc);
    assert_eq!(byte_at_pc(&engine), TRAP_BYTE);
}

#[test]
#[ignore]
fn test_unmapped_access_is_recoverable() {
    let engine = engine();
    assert!(matches!(
        engine.session().read_memory(0, 16),
        Err(CommandError::Memory(_))
    ));
    assert!(matches!(
        engine.session().write_memory(0, &[1, 2]),
        Err(CommandError::Memory(_))
    ));

    let error = engine.session().resolve_address("nowhere").err().unwrap();
    assert!(matches!(
        error.downcast_ref::<CommandError>(),
        Some(CommandError::InvalidAddress(_))
    ));
}

#[test]
#[ignore]
fn test_rejected_register_write_changes_nothing() {
    let engine = engine();
    let before = engine.session().snapshot().unwrap();

    let error = engine.session().set_register("eax", &[1]).err().unwrap();
    assert!(matches!(
        error.downcast_ref::<CommandError>(),
        Some(CommandError::UnknownRegister(_))
    ));
    let error = engine.session().set_register("rax", &[0xff; 9]).err().unwrap();
    assert!(matches!(
        error.downcast_ref::<CommandError>(),
        Some(CommandError::Assign { .. })
    ));
    assert_eq!(engine.session().snapshot().unwrap(), before);

    engine.session().set_register("rcx", &[0x42]).unwrap();
    assert_eq!(engine.session().snapshot().unwrap().general[2], 0x42);
}

#[test]
#[ignore]
fn test_write_string_appends_nul() {
    let engine = engine();
    let address = engine.session().scratch().base + 0x200;
    engine.session().write_memory(address, &[0xff; 10]).unwrap();

    assert_eq!(engine.session().write_string(address, "hi there").unwrap(), 9);
    assert_eq!(
        engine.session().read_memory(address, 10).unwrap(),
        b"hi there\0\xff"
    );

    // レジスタ名もアドレスとして使える
    engine.session().set_register("rdi", &address.to_be_bytes()).unwrap();
    assert_eq!(engine.session().resolve_address("rdi").unwrap(), address);
}
