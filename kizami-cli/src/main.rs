//! Kizami CLI - コマンドラインインターフェース
//!
//! 入力した x86_64 命令をその場で子プロセスに実行させるREPL

mod signals;

use anyhow::Result;
use clap::Parser;
use kizami_core::command::general_help;
use kizami_core::display::hexdump;
use kizami_core::{
    BinutilsAssembler, Category, Command, CommandError, CommandKind, DisplayFilter, Engine,
    RegisterView, Session, StopOutcome, Style, Syntax, YamaAuthorizer,
};
use nix::errno::Errno;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// 既定の履歴ファイル名（ホームディレクトリ直下）
const HISTORY_FILE: &str = ".kizami_history";

/// Kizami - interactive x86_64 assembler
#[derive(Parser)]
#[command(name = "kizami")]
#[command(version)]
#[command(
    about = "Assembles each line you type and executes it in a live child process",
    long_about = None
)]
struct Cli {
    /// Initial assembly syntax (intel or att)
    #[arg(long, default_value = "intel")]
    syntax: Syntax,

    /// History file (default: ~/.kizami_history)
    #[arg(long, value_name = "PATH")]
    history: Option<PathBuf>,

    /// Do not read or write the history file
    #[arg(long, conflicts_with = "history")]
    no_history: bool,

    /// Toggle a register category at startup (gpr, status, fpr_hex, fpr_double)
    #[arg(long = "show", value_name = "CATEGORY", value_parser = parse_category)]
    show: Vec<Category>,

    /// Prefix for the binutils tools (e.g. x86_64-linux-gnu-)
    #[arg(long, value_name = "PREFIX", default_value = "")]
    binutils_prefix: String,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Log filter (overrides RUST_LOG)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

fn parse_category(s: &str) -> std::result::Result<Category, String> {
    Category::from_name(s).ok_or_else(|| {
        let names: Vec<_> = Category::ALL.iter().map(|c| c.name()).collect();
        format!("expected one of {}", names.join(", "))
    })
}

/// 表示まわりの状態
struct Ui {
    filter: DisplayFilter,
    view: RegisterView,
}

/// 1行を処理した後の動作
enum Flow {
    Continue,
    Exit,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {:#}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// 致命的エラーの終了コード
///
/// エラーの連鎖に errno があればその値、なければ1です。
fn exit_status(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<Errno>())
        .and_then(|errno| u8::try_from(*errno as i32).ok())
        .filter(|code| *code != 0)
        .unwrap_or(1)
}

fn run(cli: Cli) -> Result<()> {
    println!("Kizami - interactive x86_64 assembler");
    println!("Version {}", env!("CARGO_PKG_VERSION"));
    println!();

    // リスナースレッドも含め、以降のスレッドは SIGINT をブロックした状態で作られる
    let interrupts = signals::block_interrupt()?;

    let session = Session::bootstrap(&YamaAuthorizer::new())?;
    debug!(pid = session.pid(), scratch = ?session.scratch(), "session ready");
    signals::spawn_interrupt_waiter(interrupts, session.pause_control())?;

    let assembler = BinutilsAssembler::new(cli.binutils_prefix.clone());
    let mut engine = Engine::new(session, Box::new(assembler), cli.syntax);

    let mut ui = Ui {
        filter: DisplayFilter::default(),
        view: RegisterView::new(Style { color: !cli.no_color }),
    };
    for category in &cli.show {
        ui.filter.toggle(*category);
    }

    let history = if cli.no_history {
        None
    } else {
        cli.history
            .clone()
            .or_else(|| home::home_dir().map(|home| home.join(HISTORY_FILE)))
    };

    run_repl(&mut engine, &mut ui, history)
}

/// REPLループを実行する
fn run_repl(engine: &mut Engine, ui: &mut Ui, history: Option<PathBuf>) -> Result<()> {
    println!("Type '?' for help.");
    show_registers(engine, ui)?;

    let mut rl = DefaultEditor::new()?;
    if let Some(path) = &history {
        // 初回起動時はファイルがない
        if let Err(e) = rl.load_history(path) {
            debug!(path = %path.display(), "no history loaded: {}", e);
        }
    }

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;
                if let Some(path) = &history {
                    if let Err(e) = rl.save_history(path) {
                        warn!(path = %path.display(), "Failed to save history: {}", e);
                    }
                }

                match handle_line(engine, ui, line) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Exit) => return Ok(()),
                    Err(e) => match e.downcast_ref::<CommandError>() {
                        Some(error) => println!("{}", error),
                        None => return Err(e),
                    },
                }
            }
            // 入力中の Ctrl-C は行を捨てて再入力
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

/// 1行を処理する
fn handle_line(engine: &mut Engine, ui: &mut Ui, line: &str) -> Result<Flow> {
    let Some(command) = Command::parse(line).map_err(CommandError::from)? else {
        return Ok(Flow::Continue);
    };

    match command {
        Command::Set { register, value } => engine.session().set_register(&register, &value)?,
        Command::Read { address, len } => handle_read(engine, &address, len)?,
        Command::Write { address, data } => handle_write(engine, &address, &data)?,
        Command::WriteStr { address, text } => {
            let address = engine.session().resolve_address(&address)?;
            let written = engine.session().write_string(address, &text)?;
            println!("Wrote {} bytes.", written);
        }
        Command::Alloc { len } => {
            let address = engine.session_mut().allocate(len)?;
            println!("Allocated {} bytes at 0x{:x}", len, address);
        }
        Command::Regs => show_registers(engine, ui)?,
        Command::Show(category) => {
            let shown = ui.filter.toggle(category);
            println!("{} toggled {}", category.name(), if shown { "on" } else { "off" });
        }
        Command::Syntax(Some(syntax)) => engine.set_syntax(syntax),
        Command::Syntax(None) => {
            println!("Current syntax: {}", engine.syntax());
            println!("{}", CommandKind::Syntax.usage());
        }
        Command::Help(None) => println!("{}", general_help()),
        Command::Help(Some(kind)) => println!("{}", kind.usage()),
        Command::Instruction(source) => return handle_instruction(engine, ui, &source),
    }
    Ok(Flow::Continue)
}

fn handle_read(engine: &Engine, address: &str, len: u64) -> Result<()> {
    let address = engine.session().resolve_address(address)?;
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    let data = engine.session().read_memory(address, len)?;
    print!("{}", hexdump(address, &data));
    Ok(())
}

fn handle_write(engine: &Engine, address: &str, data: &[u8]) -> Result<()> {
    let address = engine.session().resolve_address(address)?;
    engine.session().write_memory(address, data)?;
    println!("Wrote {} bytes.", data.len());
    Ok(())
}

fn handle_instruction(engine: &mut Engine, ui: &mut Ui, source: &str) -> Result<Flow> {
    let step = engine.execute(source)?;
    for insn in &step.decoded {
        println!("{}", insn.render());
    }

    match step.outcome {
        StopOutcome::Trapped { .. } => {}
        StopOutcome::Paused { pc } => println!("Interrupted at 0x{:x}", pc),
        StopOutcome::Exited(code) => {
            println!("Target exited with status {}", code);
            return Ok(Flow::Exit);
        }
    }

    show_registers(engine, ui)?;
    engine.finish_step();
    Ok(Flow::Continue)
}

/// 現在のレジスタを表示する
fn show_registers(engine: &Engine, ui: &mut Ui) -> Result<()> {
    let snapshot = engine.session().snapshot()?;
    print!("{}", ui.view.render(&snapshot, ui.filter));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["kizami"]).unwrap();
        assert_eq!(cli.syntax, Syntax::Intel);
        assert!(cli.history.is_none());
        assert!(!cli.no_history);
        assert!(cli.show.is_empty());
        assert_eq!(cli.binutils_prefix, "");
    }

    #[test]
    fn test_cli_options() {
        let cli = Cli::try_parse_from([
            "kizami",
            "--syntax",
            "att",
            "--show",
            "fpr_hex",
            "--show",
            "status",
            "--no-color",
        ])
        .unwrap();
        assert_eq!(cli.syntax, Syntax::Att);
        assert_eq!(cli.show, vec![Category::VectorHex, Category::Status]);
        assert!(cli.no_color);

        assert!(Cli::try_parse_from(["kizami", "--show", "fpr"]).is_err());
        assert!(Cli::try_parse_from(["kizami", "--syntax", "masm"]).is_err());
        assert!(Cli::try_parse_from(["kizami", "--history", "h", "--no-history"]).is_err());
    }

    #[test]
    fn test_exit_status_from_errno() {
        let error = anyhow::Error::new(Errno::EPERM).context("PTRACE_SEIZE");
        assert_eq!(exit_status(&error), Errno::EPERM as u8);
        assert_eq!(exit_status(&anyhow::anyhow!("Target terminated by SIGSEGV")), 1);
    }
}
