//! Kizami ターゲットプロセス制御
//!
//! このクレートは、命令を1つずつ注入して実行する子プロセスを制御するための低レベル機能を提供します。
//! fork とハンドシェイク、ptrace による例外チャネル、レジスタ・メモリアクセス、
//! 子プロセス内でのシステムコール実行などを行います。
//!
//! x86_64 Linux 専用です。

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("kizami-target supports x86_64 Linux only");

pub mod bridge;
pub mod flags;
pub mod memory;
pub mod process;
pub mod registers;
pub mod syscall;
pub mod thread;

pub use bridge::{ExceptionBridge, Handoff, PauseControl, StopEvent};
pub use flags::{FlagField, STATUS_FLAGS};
pub use memory::{Memory, MemoryMapping};
pub use process::{Handshake, LifecycleState, TargetProcess};
pub use registers::{
    AssignError, RegisterLocation, RegisterSnapshot, Registers, VectorRegister,
    GENERAL_REGISTERS, VECTOR_REGISTERS,
};
pub use syscall::SyscallRequest;
pub use thread::{ControlledThread, ThreadId};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;

/// トラップ命令（INT3）のオペコード
pub const TRAP_BYTE: u8 = 0xCC;

/// ターゲットのワード幅（ビット）
pub const WORD_BITS: u32 = 64;
