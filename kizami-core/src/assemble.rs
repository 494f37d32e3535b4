//! アセンブラ
//!
//! テキストから機械語への変換は外部のアセンブラに任せます。
//! 既定の実装は GNU binutils（as, ld, objcopy）を一時ディレクトリで実行します。

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// アセンブリ構文
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Syntax {
    #[default]
    Intel,
    Att,
}

impl Syntax {
    pub fn name(&self) -> &'static str {
        match self {
            Syntax::Intel => "intel",
            Syntax::Att => "att",
        }
    }
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Syntax {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intel" => Ok(Syntax::Intel),
            "att" => Ok(Syntax::Att),
            _ => Err(anyhow::anyhow!("Unknown syntax '{}' (expected intel or att)", s)),
        }
    }
}

/// アセンブルの失敗
#[derive(Debug, Error)]
pub enum AssembleError {
    /// アセンブラが入力を受け付けなかった
    #[error("{0}")]
    Rejected(String),
    /// 命令が1バイトも生成されなかった
    #[error("no machine code produced")]
    Empty,
    /// アセンブラを実行できなかった
    #[error("failed to run {tool}: {source}")]
    Tool {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// アセンブラ
pub trait Assembler {
    /// 1行のアセンブリを機械語に変換する
    ///
    /// # Arguments
    /// * `source` - アセンブリのテキスト
    /// * `bits` - ターゲットのワード幅
    /// * `address` - 配置アドレス（相対分岐のエンコードに必要）
    /// * `syntax` - 入力の構文
    fn assemble(
        &self,
        source: &str,
        bits: u32,
        address: u64,
        syntax: Syntax,
    ) -> Result<Vec<u8>, AssembleError>;
}

/// GNU binutils を使うアセンブラ
#[derive(Debug, Clone)]
pub struct BinutilsAssembler {
    prefix: String,
}

impl BinutilsAssembler {
    /// ツール名の前に付けるプレフィックス（例: `x86_64-linux-gnu-`）を指定して作成する
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn tool(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn run(&self, name: &str, args: &[&str], dir: &Path) -> Result<(), AssembleError> {
        let tool = self.tool(name);
        let output = Command::new(&tool)
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|source| AssembleError::Tool {
                tool: tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(AssembleError::Rejected(diagnostics(&String::from_utf8_lossy(
                &output.stderr,
            ))));
        }
        Ok(())
    }
}

impl Default for BinutilsAssembler {
    fn default() -> Self {
        Self::new("")
    }
}

impl Assembler for BinutilsAssembler {
    fn assemble(
        &self,
        source: &str,
        bits: u32,
        address: u64,
        syntax: Syntax,
    ) -> Result<Vec<u8>, AssembleError> {
        let dir = tempfile::tempdir().map_err(|source| AssembleError::Tool {
            tool: "tempdir".to_string(),
            source,
        })?;
        let io_err = |source| AssembleError::Tool {
            tool: "tempdir".to_string(),
            source,
        };

        std::fs::write(dir.path().join("in.s"), render_source(source, bits, syntax))
            .map_err(io_err)?;

        let (as_flag, emulation) = match bits {
            32 => ("--32", "elf_i386"),
            _ => ("--64", "elf_x86_64"),
        };
        let text = format!("-Ttext=0x{:x}", address);
        let entry = format!("0x{:x}", address);

        self.run("as", &[as_flag, "-o", "in.o", "in.s"], dir.path())?;
        self.run(
            "ld",
            &["-m", emulation, "-e", &entry, &text, "-o", "out.elf", "in.o"],
            dir.path(),
        )?;
        self.run(
            "objcopy",
            &["-O", "binary", "--only-section=.text", "out.elf", "out.bin"],
            dir.path(),
        )?;

        let code = std::fs::read(dir.path().join("out.bin")).map_err(io_err)?;
        debug!(source, address, len = code.len(), "assembled");
        if code.is_empty() {
            return Err(AssembleError::Empty);
        }
        Ok(code)
    }
}

/// アセンブラに渡すソースを組み立てる
fn render_source(source: &str, bits: u32, syntax: Syntax) -> String {
    let directive = match syntax {
        Syntax::Intel => ".intel_syntax noprefix",
        Syntax::Att => ".att_syntax prefix",
    };
    format!(".code{}\n{}\n.text\n{}\n", bits, directive, source)
}

/// アセンブラのエラー出力からファイル名などを取り除く
fn diagnostics(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.ends_with("Assembler messages:"))
        .map(|line| match line.split_once("Error: ") {
            Some((_, message)) => message,
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
