//! プロセス制御機能
//!
//! 子プロセスを fork し、パイプ2本による準備完了/応答のハンドシェイクを経て
//! 子プロセス自身に INT3 を実行させます。
//! 例外チャネルを張る前に子がトラップすると誰も受け取れないため、順序が重要です。

use crate::Result;
use anyhow::Context as _;
use nix::sys::ptrace;
use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};
use std::fs::File;
use std::io::{Read as _, Write as _};
use tracing::debug;

/// ハンドシェイクで送るバイト
const READY: u8 = b'R';

/// 権限を落とす先のユーザー/グループ（nobody）
const NOBODY: u32 = 65534;

/// ターゲットプロセスのライフサイクル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// fork 直後から初回トラップ処理まで
    Bootstrapping,
    /// 停止中（レジスタ・メモリを読み書きできる）
    Stopped,
    /// 実行中
    Running,
    /// 終了済み
    Exited,
}

/// 親プロセス側のハンドシェイク
pub struct Handshake {
    from_child: File,
    to_child: File,
}

impl Handshake {
    /// 子プロセスの「fork 完了・権限放棄済み」を待つ
    pub fn wait_ready(&mut self) -> Result<()> {
        let mut buf = [0u8; 1];
        self.from_child
            .read_exact(&mut buf)
            .context("Failed to read ready byte from child")?;
        if buf[0] != READY {
            anyhow::bail!("Unexpected handshake byte from child: 0x{:02x}", buf[0]);
        }
        Ok(())
    }

    /// 例外チャネルの準備ができたことを子プロセスに伝える
    ///
    /// 子プロセスはこれを受け取るとすぐに INT3 を実行します。
    pub fn release(mut self) -> Result<()> {
        self.to_child
            .write_all(&[READY])
            .context("Failed to send ready byte to child")
    }
}

/// 制御対象のプロセス
pub struct TargetProcess {
    pid: Pid,
    state: LifecycleState,
}

impl TargetProcess {
    /// 子プロセスを fork する
    ///
    /// 子プロセスはハンドシェイクの応答を待ってから自分自身にトラップをかけます。
    /// この関数は親プロセスでのみ戻ります。
    pub fn fork() -> Result<(Self, Handshake)> {
        let (parent_read, child_write) = unistd::pipe().context("pipe")?;
        let (child_read, parent_write) = unistd::pipe().context("pipe")?;

        // SAFETY: 子プロセスは非同期シグナル安全な処理だけを行い、戻らない
        match unsafe { unistd::fork() }.context("fork")? {
            ForkResult::Parent { child } => {
                drop(child_write);
                drop(child_read);
                debug!(pid = child.as_raw(), "forked child");
                Ok((
                    Self {
                        pid: child,
                        state: LifecycleState::Bootstrapping,
                    },
                    Handshake {
                        from_child: File::from(parent_read),
                        to_child: File::from(parent_write),
                    },
                ))
            }
            ForkResult::Child => {
                drop(parent_read);
                drop(parent_write);
                child_main(File::from(child_write), File::from(child_read))
            }
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// ライフサイクル状態を取得する
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// 停止状態として記録する
    pub fn mark_stopped(&mut self) {
        self.state = LifecycleState::Stopped;
    }

    /// 終了状態として記録する
    pub fn mark_exited(&mut self) {
        self.state = LifecycleState::Exited;
    }

    /// 例外チャネルを張る（PTRACE_SEIZE）
    ///
    /// 呼び出したスレッドがトレーサになり、以降の ptrace 要求はこのスレッドからのみ発行できます。
    /// 親プロセスが終了すると子プロセスも終了します。
    pub fn seize(&self) -> Result<()> {
        ptrace::seize(self.pid, ptrace::Options::PTRACE_O_EXITKILL).context("PTRACE_SEIZE")
    }

    /// プロセスを実行継続する
    ///
    /// `signal` を指定するとそのシグナルを配送して再開します。
    /// `None` の場合、停止の原因になったシグナルは捨てられます。
    pub fn resume(&mut self, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(self.pid, signal).context("PTRACE_CONT")?;
        self.state = LifecycleState::Running;
        Ok(())
    }
}

/// 子プロセス側の処理
fn child_main(mut to_parent: File, mut from_parent: File) -> ! {
    // 端末の Ctrl-C が届かないよう別のプロセスグループに移る
    let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
    let _ = SigSet::empty().thread_set_mask();
    for sig in [Signal::SIGSEGV, Signal::SIGBUS, Signal::SIGILL, Signal::SIGFPE] {
        // SAFETY: デフォルト動作に戻すだけ
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }

    // 権限を落とす（失敗しても続行）
    let _ = unistd::setgid(Gid::from_raw(NOBODY));
    let _ = unistd::setuid(Uid::from_raw(NOBODY));

    if to_parent.write_all(&[READY]).is_err() {
        child_abort();
    }

    let mut buf = [0u8; 1];
    if from_parent.read_exact(&mut buf).is_err() || buf[0] != READY {
        child_abort();
    }

    // 親の例外ハンドラが受け取る
    // SAFETY: INT3 は SIGTRAP を発生させるだけ
    unsafe { std::arch::asm!("int3") };

    // 親が RIP をスクラッチ領域に移すので、ここには戻らない
    loop {
        unistd::pause();
    }
}

fn child_abort() -> ! {
    // SAFETY: fork 後の子プロセスでは atexit ハンドラを走らせない
    unsafe { nix::libc::_exit(1) }
}
