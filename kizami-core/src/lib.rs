//! Kizami のコア機能
//!
//! このクレートは、1命令ずつアセンブルして子プロセスで実行するための中核ロジックを提供します。
//! 制御セッションと実行エンジン、REPLコマンドのパース、レジスタ表示、
//! 外部アセンブラ・逆アセンブラとの連携を含みます。

pub mod assemble;
pub mod auth;
pub mod command;
pub mod disasm;
pub mod display;
pub mod errors;
pub mod parse;
pub mod session;
pub mod stepping;

pub use assemble::{AssembleError, Assembler, BinutilsAssembler, Syntax};
pub use auth::{Authorizer, YamaAuthorizer};
pub use command::{Command, CommandKind, ParseError};
pub use display::{Category, DisplayFilter, RegisterView, Style};
pub use errors::{CommandError, CommandResult};
pub use session::{ScratchRegion, Session, StopOutcome};
pub use stepping::{Engine, EngineState, Step};

// 他のクレートから使用するために再エクスポート
pub use kizami_target::{LifecycleState, RegisterLocation, RegisterSnapshot};

/// コア機能の結果型
pub type Result<T> = anyhow::Result<T>;
