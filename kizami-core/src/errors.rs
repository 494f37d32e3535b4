//! コマンド実行時のエラー
//!
//! ここに挙げるエラーはすべて回復可能で、REPL はメッセージを表示して次の入力に進みます。
//! ターゲットの制御そのものが失敗した場合は `anyhow::Error` のまま呼び出し元に返し、致命的エラーとして扱います。

use crate::assemble::AssembleError;
use crate::command::ParseError;
use kizami_target::AssignError;
use thiserror::Error;

/// コマンド実行時のエラー
#[derive(Debug, Error)]
pub enum CommandError {
    /// 入力行の形式が不正
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// アドレスとして解釈できない
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    /// 未知のレジスタ名
    #[error("Unknown register: {0}")]
    UnknownRegister(String),
    /// レジスタに値を代入できない
    #[error("Cannot set {register}: {source}")]
    Assign {
        register: String,
        #[source]
        source: AssignError,
    },
    /// アセンブルに失敗した
    #[error("Assembly failed: {0}")]
    Assemble(#[from] AssembleError),
    /// メモリの読み書き・確保に失敗した
    #[error("{0:#}")]
    Memory(anyhow::Error),
}

/// コマンドの結果型
pub type CommandResult<T> = std::result::Result<T, CommandError>;
