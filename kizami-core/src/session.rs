//! 制御セッション
//!
//! 子プロセス・制御スレッド・例外ブリッジ・スクラッチ領域をまとめて所有します。
//! ptrace の要求はトレーサになったスレッドからしか発行できないため、
//! `Session` を作ったスレッド（コントローラ）以外から操作してはいけません。

use crate::auth::Authorizer;
use crate::errors::{CommandError, CommandResult};
use crate::parse::resolve_value;
use crate::Result;
use anyhow::Context as _;
use kizami_target::syscall::{decode_return, STUB};
use kizami_target::{
    ControlledThread, ExceptionBridge, LifecycleState, Memory, PauseControl, RegisterLocation,
    RegisterSnapshot, Registers, StopEvent, SyscallRequest, TargetProcess, TRAP_BYTE,
};
use nix::errno::Errno;
use nix::libc::{PROT_EXEC, PROT_READ, PROT_WRITE};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// スクラッチ領域のサイズ
pub const SCRATCH_LEN: u64 = 0x10000;

/// 注入した命令を置くRWX領域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    pub base: u64,
    pub len: u64,
}

impl ScratchRegion {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.len
    }
}

/// ターゲットが止まった結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// トラップに到達した（PC はトラップバイトを指している）
    Trapped { pc: u64 },
    /// 操作者の割り込みで止まった（PC は命令境界とは限らない）
    Paused { pc: u64 },
    /// 子プロセスが自分で終了した
    Exited(i32),
}

/// 制御セッション
pub struct Session {
    process: TargetProcess,
    registers: Registers,
    memory: Memory,
    bridge: ExceptionBridge,
    pause: Arc<PauseControl>,
    scratch: ScratchRegion,
}

impl Session {
    /// 子プロセスを起動し、スクラッチ領域の先頭で停止させる
    ///
    /// ここでの失敗はすべて致命的です（権限を落とす処理だけは子プロセス側で無視されます）。
    pub fn bootstrap(authorizer: &dyn Authorizer) -> Result<Self> {
        authorizer.authorize().context("authorization")?;

        let (mut process, mut handshake) = TargetProcess::fork()?;
        handshake.wait_ready()?;

        // 子がトラップする前にチャネルを張っておく
        process.seize()?;
        let pause = Arc::new(PauseControl::new(process.pid()));
        let bridge = ExceptionBridge::install(process.pid(), Arc::clone(&pause))?;
        handshake.release()?;

        match bridge.wait() {
            StopEvent::Trap => {}
            other => anyhow::bail!("Unexpected stop while bootstrapping: {:?}", other),
        }

        let thread = ControlledThread::discover(process.pid())?;
        let registers = Registers::new(thread.tid());
        let site = registers.rewind_pc(1)?;
        process.mark_stopped();
        debug!(pid = process.pid(), tid = thread.tid(), site, "initial trap");

        let memory = Memory::new(process.pid());
        let mut session = Self {
            process,
            registers,
            memory,
            bridge,
            pause,
            scratch: ScratchRegion { base: 0, len: 0 },
        };

        let base = session
            .remote_syscall(
                site,
                SyscallRequest::mmap_anonymous(SCRATCH_LEN, PROT_READ | PROT_WRITE | PROT_EXEC),
            )?
            .context("mmap in target")?;
        session.scratch = ScratchRegion {
            base,
            len: SCRATCH_LEN,
        };

        let mapping = session
            .memory
            .mapping_containing(base)?
            .ok_or_else(|| anyhow::anyhow!("Scratch region 0x{:x} is not mapped", base))?;
        if !(mapping.readable && mapping.writable && mapping.executable) {
            anyhow::bail!("Scratch region 0x{:x} is not rwx", base);
        }

        session.memory.write_u8(base, TRAP_BYTE)?;
        session.registers.set_pc(base)?;
        info!(pid = session.pid(), base, "scratch region ready");
        Ok(session)
    }

    /// ターゲットのプロセスID
    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    pub fn state(&self) -> LifecycleState {
        self.process.state()
    }

    pub fn scratch(&self) -> ScratchRegion {
        self.scratch
    }

    /// 割り込み要求の状態（シグナル待ちスレッドと共有する）
    pub fn pause_control(&self) -> Arc<PauseControl> {
        Arc::clone(&self.pause)
    }

    fn require_stopped(&self) -> Result<()> {
        match self.process.state() {
            LifecycleState::Stopped => Ok(()),
            state => anyhow::bail!("Target is not stopped ({:?})", state),
        }
    }

    /// ターゲットを再開する
    ///
    /// 次の `wait_for_stop` が戻るまで、操作者の割り込みを受け付けます。
    pub fn resume(&mut self) -> Result<()> {
        self.require_stopped()?;
        self.pause.set_awaiting_stop(true);
        let resumed = self.process.resume(None);
        if resumed.is_err() {
            self.pause.set_awaiting_stop(false);
        }
        resumed
    }

    /// ターゲットが止まるまで待つ
    ///
    /// トラップ以外のシグナルは処理せずにそのまま子プロセスへ配送し、待ち続けます。
    /// SIGSEGV などの既定動作で子プロセスが死んだ場合はエラーになります。
    pub fn wait_for_stop(&mut self) -> Result<StopOutcome> {
        let interruptible = self.pause.is_awaiting_stop();
        loop {
            let event = self.bridge.wait();
            self.pause.set_awaiting_stop(false);
            debug!(?event, "handoff");
            match event {
                StopEvent::Trap => {
                    let pc = self.registers.rewind_pc(1)?;
                    self.process.mark_stopped();
                    return Ok(StopOutcome::Trapped { pc });
                }
                StopEvent::Paused => {
                    let pc = self.registers.get_pc()?;
                    self.process.mark_stopped();
                    return Ok(StopOutcome::Paused { pc });
                }
                StopEvent::Signal(sig) => {
                    warn!(%sig, "rejecting unexpected signal");
                    self.pause.set_awaiting_stop(interruptible);
                    self.process.resume(Some(sig))?;
                }
                StopEvent::Exited(code) => {
                    self.process.mark_exited();
                    return Ok(StopOutcome::Exited(code));
                }
                StopEvent::Killed(sig) => {
                    self.process.mark_exited();
                    anyhow::bail!("Target terminated by {}", sig);
                }
                StopEvent::ChannelLost(errno) => {
                    self.process.mark_exited();
                    return Err(anyhow::Error::new(errno).context("waitpid"));
                }
            }
        }
    }

    /// レジスタのスナップショットを取る
    pub fn snapshot(&self) -> Result<RegisterSnapshot> {
        self.require_stopped()?;
        self.registers.snapshot()
    }

    /// スナップショットを書き戻す
    pub fn write_snapshot(&self, snapshot: &RegisterSnapshot) -> Result<()> {
        self.require_stopped()?;
        self.registers.write_snapshot(snapshot)
    }

    /// プログラムカウンタ
    pub fn pc(&self) -> Result<u64> {
        self.require_stopped()?;
        self.registers.get_pc()
    }

    /// メモリを読む（読めた分だけ）
    pub fn read_memory(&self, address: u64, len: usize) -> CommandResult<Vec<u8>> {
        self.memory
            .read_available(address, len)
            .map_err(CommandError::Memory)
    }

    /// メモリに書き込む
    pub fn write_memory(&self, address: u64, data: &[u8]) -> CommandResult<()> {
        self.memory.write(address, data).map_err(CommandError::Memory)
    }

    /// 文字列をNUL終端付きで書き込み、書き込んだバイト数を返す
    pub fn write_string(&self, address: u64, text: &str) -> CommandResult<usize> {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        self.write_memory(address, &data)?;
        Ok(data.len())
    }

    /// アドレス引数（数値または汎用レジスタ名）を解決する
    pub fn resolve_address(&self, token: &str) -> Result<u64> {
        let snapshot = self.snapshot()?;
        match resolve_value(token, &snapshot) {
            Some(address) => Ok(address),
            None => Err(CommandError::InvalidAddress(token.to_string()).into()),
        }
    }

    /// レジスタ1つに値を代入する
    ///
    /// 名前が未知の場合や値が収まらない場合は何も書き込みません。
    pub fn set_register(&self, name: &str, value: &[u8]) -> Result<()> {
        let location = RegisterLocation::resolve(name)
            .ok_or_else(|| CommandError::UnknownRegister(name.to_string()))?;
        let mut snapshot = self.snapshot()?;
        snapshot
            .assign(location, value)
            .map_err(|source| CommandError::Assign {
                register: name.to_string(),
                source,
            })?;
        self.write_snapshot(&snapshot)
    }

    /// ターゲット内に読み書き可能なメモリを確保する
    ///
    /// ptrace の失敗は致命的エラー、mmap の失敗は `CommandError::Memory` です。
    pub fn allocate(&mut self, len: u64) -> Result<u64> {
        let site = self.scratch.base;
        let request = SyscallRequest::mmap_anonymous(len, PROT_READ | PROT_WRITE);
        match self.remote_syscall(site, request)? {
            Ok(address) => {
                debug!(len, address, "allocated");
                Ok(address)
            }
            Err(errno) => {
                let source = anyhow::Error::new(errno).context("mmap in target");
                Err(CommandError::Memory(source).into())
            }
        }
    }

    /// ターゲット自身にシステムコールを発行させる
    ///
    /// `site` に `syscall; int3` を書いて実行し、終わったら元のコードとレジスタを戻します。
    /// 外側の `Result` は制御の失敗、内側はシステムコールの戻り値です。
    /// スタブの実行中は操作者の割り込みを受け付けません。
    pub fn remote_syscall(
        &mut self,
        site: u64,
        request: SyscallRequest,
    ) -> Result<std::result::Result<u64, Errno>> {
        self.require_stopped()?;
        let saved_regs = self.registers.read()?;
        let saved_code = self.memory.read(site, STUB.len())?;

        self.memory.write(site, &STUB)?;
        self.registers.write(request.prepare(&saved_regs, site))?;
        self.process.resume(None)?;

        loop {
            match self.wait_for_stop()? {
                StopOutcome::Trapped { .. } => break,
                // グループストップなら続行する
                StopOutcome::Paused { .. } => self.process.resume(None)?,
                StopOutcome::Exited(code) => anyhow::bail!(
                    "Target exited with {} during syscall {}",
                    code,
                    request.number
                ),
            }
        }

        let result = self.registers.read()?;
        self.memory.write(site, &saved_code)?;
        self.registers.write(saved_regs)?;
        debug!(number = request.number, rax = result.rax, "remote syscall");
        Ok(decode_return(result.rax))
    }

    /// リスナースレッドが生きているか
    pub fn is_listening(&self) -> bool {
        self.bridge.is_listening()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_region_bounds() {
        let scratch = ScratchRegion {
            base: 0x7000_0000,
            len: SCRATCH_LEN,
        };
        assert!(scratch.contains(0x7000_0000));
        assert!(scratch.contains(0x7000_ffff));
        assert!(!scratch.contains(0x7001_0000));
        assert!(!scratch.contains(0x6fff_ffff));
    }
}
