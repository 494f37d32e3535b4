//! REPLコマンド
//!
//! `.` で始まる行はコマンド、`?` で始まる行はヘルプ、それ以外はアセンブリとして扱います。

use crate::assemble::Syntax;
use crate::display::Category;
use crate::parse::{parse_hex_bytes, parse_number};
use kizami_target::{GENERAL_REGISTERS, STATUS_FLAGS, VECTOR_REGISTERS};
use thiserror::Error;

/// `.read` の既定の長さ
pub const DEFAULT_READ_LEN: u64 = 0x20;

/// コマンドの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Set,
    Read,
    Write,
    WriteStr,
    Alloc,
    Regs,
    Show,
    Syntax,
}

impl CommandKind {
    /// 全コマンド（ヘルプの表示順）
    pub const ALL: [CommandKind; 8] = [
        CommandKind::Set,
        CommandKind::Read,
        CommandKind::Write,
        CommandKind::WriteStr,
        CommandKind::Alloc,
        CommandKind::Regs,
        CommandKind::Show,
        CommandKind::Syntax,
    ];

    /// コマンド名（`.` を除く）
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Set => "set",
            CommandKind::Read => "read",
            CommandKind::Write => "write",
            CommandKind::WriteStr => "writestr",
            CommandKind::Alloc => "alloc",
            CommandKind::Regs => "regs",
            CommandKind::Show => "show",
            CommandKind::Syntax => "syntax",
        }
    }

    /// 名前からコマンドを検索する
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// 一覧用の短い説明
    pub fn summary(&self) -> &'static str {
        match self {
            CommandKind::Set => "change value of register",
            CommandKind::Read => "read from memory",
            CommandKind::Write => "write hex to memory",
            CommandKind::WriteStr => "write string to memory",
            CommandKind::Alloc => "allocate memory",
            CommandKind::Regs => "show the contents of the registers",
            CommandKind::Show => "toggle shown register types",
            CommandKind::Syntax => "change the assembly syntax to intel or at&t",
        }
    }

    /// 使い方
    pub fn usage(&self) -> String {
        match self {
            CommandKind::Set => format!(
                "Usage: .set register value\n\
                 Changes the value of a register\n\
                 \n\
                 \x20 register - register name (GPR, FPR or status)\n\
                 \x20 value    - hex if GPR or FPR, 0 or 1 if status\n\
                 \n\
                 \x20 GPR:    {}\n\
                 \x20 FPR:    {}\n\
                 \x20 status: {}",
                GENERAL_REGISTERS.iter().map(|r| r.name).collect::<Vec<_>>().join(" "),
                VECTOR_REGISTERS.join(" "),
                STATUS_FLAGS.iter().map(|f| f.name).collect::<Vec<_>>().join(" "),
            ),
            CommandKind::Read => "Usage: .read address [len]\n\
                 Displays a hexdump of memory starting at address\n\
                 \n\
                 \x20 address - an integer or a register name\n\
                 \x20 len     - the amount of bytes to read (default 32)"
                .to_string(),
            CommandKind::Write => "Usage: .write address hexpairs\n\
                 Writes hexpairs to a destination address\n\
                 \n\
                 \x20 address  - an integer or a register name\n\
                 \x20 hexpairs - pairs of hexadecimal numbers"
                .to_string(),
            CommandKind::WriteStr => "Usage: .writestr address string\n\
                 Writes a NUL-terminated ascii string to a destination address\n\
                 \n\
                 \x20 address - an integer or a register name\n\
                 \x20 string  - an ascii string (rest of the line)"
                .to_string(),
            CommandKind::Alloc => "Usage: .alloc len\n\
                 Allocates some memory and returns the address\n\
                 \n\
                 \x20 len - the amount of bytes to allocate"
                .to_string(),
            CommandKind::Regs => "Usage: .regs\n\
                 Displays the values of the registers currently toggled on"
                .to_string(),
            CommandKind::Show => format!(
                "Usage: .show [{}]\n\
                 Toggles which types of registers are shown\n\
                 \n{}",
                Category::ALL.iter().map(|c| c.name()).collect::<Vec<_>>().join("|"),
                Category::ALL
                    .iter()
                    .map(|c| format!("  {:<10} - {}", c.name(), c.description()))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            CommandKind::Syntax => "Usage: .syntax [att|intel]\n\
                 Changes the assembly syntax to intel or at&t"
                .to_string(),
        }
    }
}

/// 全体のヘルプ
pub fn general_help() -> String {
    let mut text = String::from(
        "Valid input:\n\
         \x20 Help:\n\
         \x20   ?      - show this help\n\
         \x20   ?[cmd] - show help for a command\n\
         \n\
         \x20 Commands:\n",
    );
    for kind in CommandKind::ALL {
        text.push_str(&format!("    .{:<9}- {}\n", kind.name(), kind.summary()));
    }
    text.push_str("\nAny other input will be interpreted as x86_64 assembly");
    text
}

/// REPLコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// レジスタ・フラグに値を書き込む（値はビッグエンディアン表記のバイト列）
    Set { register: String, value: Vec<u8> },
    /// メモリをダンプする
    Read { address: String, len: u64 },
    /// メモリにバイト列を書き込む
    Write { address: String, data: Vec<u8> },
    /// メモリにNUL終端文字列を書き込む
    WriteStr { address: String, text: String },
    /// メモリを確保する
    Alloc { len: u64 },
    /// レジスタを再表示する
    Regs,
    /// 表示カテゴリを切り替える
    Show(Category),
    /// 構文を取得・設定する
    Syntax(Option<Syntax>),
    /// ヘルプを表示する
    Help(Option<CommandKind>),
    /// 1行のアセンブリ
    Instruction(String),
}

/// コマンドのパースエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// 引数の数や形式が不正
    #[error("{}", .0.usage())]
    Usage(CommandKind),
    /// `.write` の16進が不正
    #[error("Invalid hexpairs!")]
    InvalidHexPairs,
    /// 未知のコマンド
    #[error("Invalid command: .{0}")]
    Unknown(String),
}

impl Command {
    /// 入力行をパースする
    ///
    /// 空行は `Ok(None)` を返します。
    pub fn parse(input: &str) -> Result<Option<Self>, ParseError> {
        let line = input.trim();
        if line.is_empty() {
            return Ok(None);
        }

        if let Some(topic) = line.strip_prefix('?') {
            return Ok(Some(Command::Help(CommandKind::from_name(topic.trim()))));
        }

        let Some(body) = line.strip_prefix('.') else {
            return Ok(Some(Command::Instruction(line.to_string())));
        };

        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim_start()),
            None => (body, ""),
        };
        let kind =
            CommandKind::from_name(name).ok_or_else(|| ParseError::Unknown(name.to_string()))?;
        let args: Vec<&str> = rest.split_whitespace().collect();
        let usage = || ParseError::Usage(kind);

        let command = match kind {
            CommandKind::Set => match args.as_slice() {
                [register, value] => Command::Set {
                    register: register.to_string(),
                    value: parse_hex_bytes(value, true).map_err(|_| usage())?,
                },
                _ => return Err(usage()),
            },
            CommandKind::Read => match args.as_slice() {
                [address] => Command::Read {
                    address: address.to_string(),
                    len: DEFAULT_READ_LEN,
                },
                [address, len] => Command::Read {
                    address: address.to_string(),
                    len: parse_number(len).map_err(|_| usage())?,
                },
                _ => return Err(usage()),
            },
            CommandKind::Write => match args.as_slice() {
                [address, hex] => Command::Write {
                    address: address.to_string(),
                    data: parse_hex_bytes(hex, false).map_err(|_| ParseError::InvalidHexPairs)?,
                },
                _ => return Err(usage()),
            },
            CommandKind::WriteStr => match rest.split_once(char::is_whitespace) {
                Some((address, text)) if !text.is_empty() => Command::WriteStr {
                    address: address.to_string(),
                    text: text.to_string(),
                },
                _ => return Err(usage()),
            },
            CommandKind::Alloc => match args.as_slice() {
                [len] => Command::Alloc {
                    len: parse_number(len).map_err(|_| usage())?,
                },
                _ => return Err(usage()),
            },
            CommandKind::Regs => match args.as_slice() {
                [] => Command::Regs,
                _ => return Err(usage()),
            },
            CommandKind::Show => match args.as_slice() {
                [category] => Command::Show(Category::from_name(category).ok_or_else(usage)?),
                _ => return Err(usage()),
            },
            CommandKind::Syntax => match args.as_slice() {
                [] => Command::Syntax(None),
                [syntax] => Command::Syntax(Some(syntax.parse().map_err(|_| usage())?)),
                _ => return Err(usage()),
            },
        };
        Ok(Some(command))
    }
}
