//! スレッド管理機能

use crate::Result;
use anyhow::Context as _;

/// スレッドID
pub type ThreadId = i32;

/// 制御対象のスレッド
///
/// ターゲットプロセスには常にこのスレッド1つだけが存在する前提です。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlledThread {
    tid: ThreadId,
}

impl ControlledThread {
    /// スレッドを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self { tid }
    }

    /// プロセスのスレッドを列挙し、唯一のスレッドを取得する
    ///
    /// スレッド数が1でない場合はエラーを返します。
    pub fn discover(pid: i32) -> Result<Self> {
        let tids = list_threads(pid)?;
        match tids.as_slice() {
            [tid] => Ok(Self::new(*tid)),
            _ => anyhow::bail!("1 thread expected, got {}", tids.len()),
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }
}

/// /proc/pid/task からスレッドIDを列挙する
pub fn list_threads(pid: i32) -> Result<Vec<ThreadId>> {
    let task_dir = format!("/proc/{}/task", pid);
    let mut tids = Vec::new();
    let entries =
        std::fs::read_dir(&task_dir).with_context(|| format!("Failed to list {}", task_dir))?;
    for entry in entries {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_own_threads() {
        let pid = std::process::id() as i32;
        let tids = list_threads(pid).unwrap();
        // メインスレッドのTIDはPIDと等しい
        assert!(tids.contains(&pid));
    }

    #[test]
    fn test_discover_missing_process() {
        assert!(ControlledThread::discover(-1).is_err());
    }
}
