//! Ctrl-C の処理
//!
//! SIGINT は全スレッドでブロックし、専用のスレッドが `sigwait` で受け取ります。

use anyhow::{Context as _, Result};
use kizami_target::PauseControl;
use nix::sys::signal::{SigSet, Signal};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// 呼び出しスレッドで SIGINT をブロックする
///
/// 以降に作られるスレッドはこのマスクを引き継ぐため、他のスレッドを作る前に呼びます。
pub fn block_interrupt() -> Result<SigSet> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.thread_block().context("pthread_sigmask(SIGINT)")?;
    Ok(set)
}

/// SIGINT を受けて割り込みを要求するスレッドを起動する
pub fn spawn_interrupt_waiter(set: SigSet, pause: Arc<PauseControl>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("interrupt-waiter".into())
        .spawn(move || loop {
            match set.wait() {
                Ok(sig) => match pause.request_pause() {
                    Ok(true) => debug!(%sig, "pause requested"),
                    Ok(false) => debug!(%sig, "ignored while target is stopped"),
                    Err(e) => warn!("Failed to pause target: {:#}", e),
                },
                Err(errno) => {
                    warn!(%errno, "sigwait failed");
                    return;
                }
            }
        })
        .context("Failed to spawn interrupt waiter")
}
