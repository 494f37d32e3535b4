//! プロセス制御の権限確認
//!
//! 起動時に1回だけ確認し、失敗した場合は何もせずに終了します。

use crate::Result;
use std::path::{Path, PathBuf};

/// Yama の ptrace_scope 設定ファイル
pub const YAMA_PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// プロセス制御の権限確認
pub trait Authorizer {
    fn authorize(&self) -> Result<()>;
}

/// Yama LSM の設定を確認する
///
/// 子孫プロセスへのアタッチはスコープ 0〜2 で許可されます
/// （2 は CAP_SYS_PTRACE が必要）。3 はあらゆる ptrace を禁止します。
#[derive(Debug, Clone)]
pub struct YamaAuthorizer {
    path: PathBuf,
}

impl YamaAuthorizer {
    pub fn new() -> Self {
        Self::with_path(YAMA_PTRACE_SCOPE)
    }

    /// 設定ファイルのパスを指定して作成する
    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Default for YamaAuthorizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Authorizer for YamaAuthorizer {
    fn authorize(&self) -> Result<()> {
        let scope = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            // Yama が無効ならカーネルの通常の権限確認だけ
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(anyhow::anyhow!("Failed to read {}: {}", self.path.display(), e));
            }
        };

        match scope.trim() {
            "0" | "1" | "2" => Ok(()),
            "3" => Err(anyhow::anyhow!(
                "ptrace is disabled on this system (kernel.yama.ptrace_scope = 3)"
            )),
            other => Err(anyhow::anyhow!("Unexpected ptrace_scope value '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_file(contents: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[test]
    fn test_allowed_scopes() {
        for scope in ["0\n", "1\n", "2\n"] {
            let file = scope_file(scope);
            assert!(YamaAuthorizer::with_path(file.path()).authorize().is_ok());
        }
    }

    #[test]
    fn test_disabled_scope() {
        let file = scope_file("3\n");
        assert!(YamaAuthorizer::with_path(file.path()).authorize().is_err());
    }

    #[test]
    fn test_missing_yama() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptrace_scope");
        assert!(YamaAuthorizer::with_path(path).authorize().is_ok());
    }
}
