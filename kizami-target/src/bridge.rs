//! 例外同期ブリッジ
//!
//! 専用のリスナースレッドが `waitpid` でカーネルからの停止通知を待ち、
//! 非同期に届く「子プロセスがトラップした」という事象を、
//! コントローラスレッドが待てる1回きりのハンドオフに変換します。
//!
//! リスナーとコントローラの間で共有されるのはハンドオフだけです。
//! ターゲットはハンドオフが渡されてからコントローラが再開するまで停止しています。

use crate::Result;
use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// リスナーからコントローラに渡される停止事象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// INT3 による停止。RIP はトラップバイトの1バイト先を指している
    Trap,
    /// 操作者の割り込みによる停止。RIP は命令境界とは限らない
    Paused,
    /// トラップ以外のシグナルによる停止（未処理として子プロセスに戻す）
    Signal(Signal),
    /// 子プロセスが終了した
    Exited(i32),
    /// 子プロセスがシグナルで死んだ
    Killed(Signal),
    /// 例外チャネル自体が壊れた
    ChannelLost(Errno),
}

impl StopEvent {
    /// これ以降、事象が届かないか
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StopEvent::Exited(_) | StopEvent::Killed(_) | StopEvent::ChannelLost(_)
        )
    }

    /// `waitpid` の結果を停止事象に変換する
    ///
    /// 割り込み要求中の SIGSTOP は `Paused` になり、要求は消費されます。
    pub fn from_wait_status(status: WaitStatus, pause_requested: &AtomicBool) -> Option<Self> {
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => Some(StopEvent::Trap),
            WaitStatus::Stopped(_, Signal::SIGSTOP)
                if pause_requested.swap(false, Ordering::SeqCst) =>
            {
                Some(StopEvent::Paused)
            }
            WaitStatus::Stopped(_, sig) => Some(StopEvent::Signal(sig)),
            // PTRACE_SEIZE 下のグループストップ
            WaitStatus::PtraceEvent(_, _, _) => Some(StopEvent::Paused),
            WaitStatus::Exited(_, code) => Some(StopEvent::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(StopEvent::Killed(sig)),
            _ => None,
        }
    }
}

/// 二値ランデブー
///
/// リスナーが停止事象ごとに1回だけ `release` し、コントローラが `wait` で受け取ります。
pub struct Handoff {
    slot: Mutex<Option<StopEvent>>,
    ready: Condvar,
}

impl Handoff {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// 停止事象を渡してコントローラを起こす
    pub fn release(&self, event: StopEvent) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(event) {
            warn!(?previous, ?event, "handoff released twice before being taken");
        }
        self.ready.notify_one();
    }

    /// 停止事象が渡されるまでブロックする
    pub fn wait(&self) -> StopEvent {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(event) = slot.take() {
                return event;
            }
            slot = self.ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for Handoff {
    fn default() -> Self {
        Self::new()
    }
}

/// 操作者の割り込み要求の状態
///
/// コントローラがターゲットを再開してからハンドオフを受け取るまでの間だけ、割り込みを受け付けます。
pub struct PauseControl {
    pid: Pid,
    awaiting_stop: AtomicBool,
    pause_requested: AtomicBool,
}

impl PauseControl {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            awaiting_stop: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
        }
    }

    /// ターゲットの停止待ちに入る/出る
    pub fn set_awaiting_stop(&self, awaiting: bool) {
        self.awaiting_stop.store(awaiting, Ordering::SeqCst);
    }

    /// ターゲットの停止待ち中か
    pub fn is_awaiting_stop(&self) -> bool {
        self.awaiting_stop.load(Ordering::SeqCst)
    }

    /// 割り込みを要求する
    ///
    /// ターゲットが止まっている間は何もせず `false` を返します。
    /// 実行中ならトラップ機構の外でターゲットを SIGSTOP で止め、`true` を返します。
    pub fn request_pause(&self) -> Result<bool> {
        if !self.is_awaiting_stop() {
            return Ok(false);
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        signal::kill(self.pid, Signal::SIGSTOP).context("kill(SIGSTOP)")?;
        Ok(true)
    }

    fn pause_flag(&self) -> &AtomicBool {
        &self.pause_requested
    }
}

/// 例外チャネルとリスナースレッド
pub struct ExceptionBridge {
    handoff: Arc<Handoff>,
    listener: JoinHandle<()>,
}

impl ExceptionBridge {
    /// リスナースレッドを起動する
    ///
    /// 呼び出し前に `TargetProcess::seize` で例外チャネルが張られている必要があります。
    pub fn install(pid: i32, pause: Arc<PauseControl>) -> Result<Self> {
        let handoff = Arc::new(Handoff::new());
        let listener_handoff = Arc::clone(&handoff);
        let listener = thread::Builder::new()
            .name("exception-listener".into())
            .spawn(move || listen(Pid::from_raw(pid), &listener_handoff, &pause))
            .context("Failed to spawn exception listener")?;

        Ok(Self { handoff, listener })
    }

    /// 次の停止事象を待つ
    pub fn wait(&self) -> StopEvent {
        self.handoff.wait()
    }

    /// リスナースレッドが終了しているか
    pub fn is_listening(&self) -> bool {
        !self.listener.is_finished()
    }
}

/// リスナースレッド本体
fn listen(pid: Pid, handoff: &Handoff, pause: &PauseControl) {
    loop {
        let status = match waitpid(pid, None) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                handoff.release(StopEvent::ChannelLost(errno));
                return;
            }
        };

        let Some(event) = StopEvent::from_wait_status(status, pause.pause_flag()) else {
            debug!(?status, "ignoring wait status");
            continue;
        };
        debug!(?event, "target stopped");
        handoff.release(event);
        if event.is_terminal() {
            return;
        }
    }
}
