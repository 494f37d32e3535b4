//! 1命令ずつの実行
//!
//! アセンブル → 現在のPCに書き込み → 直後にトラップバイトを置く → 再開 → ハンドオフ待ち、
//! の順に進みます。待機中のポーリングはしません。

use crate::assemble::{Assembler, Syntax};
use crate::disasm::{disassemble, DecodedInstruction};
use crate::errors::CommandError;
use crate::session::{Session, StopOutcome};
use crate::Result;
use kizami_target::{TRAP_BYTE, WORD_BITS};
use tracing::{debug, warn};

/// 実行エンジンの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// 停止中でPCにトラップバイトがあり、入力を待っている
    Idle,
    /// 命令を注入して再開した
    Stepping,
    /// ハンドオフを受け取った
    Stopped,
}

/// 1命令の実行結果
#[derive(Debug, Clone)]
pub struct Step {
    /// 注入したバイト列の逆アセンブル
    pub decoded: Vec<DecodedInstruction>,
    pub outcome: StopOutcome,
}

/// 実行エンジン
pub struct Engine {
    session: Session,
    assembler: Box<dyn Assembler>,
    syntax: Syntax,
    state: EngineState,
}

impl Engine {
    pub fn new(session: Session, assembler: Box<dyn Assembler>, syntax: Syntax) -> Self {
        Self {
            session,
            assembler,
            syntax,
            state: EngineState::Idle,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn syntax(&self) -> Syntax {
        self.syntax
    }

    pub fn set_syntax(&mut self, syntax: Syntax) {
        self.syntax = syntax;
    }

    /// 新しいスナップショットを表示し終えたら呼ぶ
    pub fn finish_step(&mut self) {
        if self.state == EngineState::Stopped {
            self.state = EngineState::Idle;
        }
    }

    /// 1行のアセンブリを実行する
    ///
    /// アセンブルに失敗した場合は `CommandError::Assemble` を返し、何も書き込みません。
    pub fn execute(&mut self, source: &str) -> Result<Step> {
        let pc = self.session.pc()?;
        let code = self
            .assembler
            .assemble(source, WORD_BITS, pc, self.syntax)
            .map_err(CommandError::from)?;
        // 表示用なので失敗しても実行は続ける
        let decoded = disassemble(&code, pc, self.syntax).unwrap_or_else(|e| {
            warn!("{:#}", e);
            Vec::new()
        });
        debug!(source, pc, len = code.len(), "injecting");

        let mut armed = code;
        armed.push(TRAP_BYTE);
        self.session.write_memory(pc, &armed)?;

        self.session.resume()?;
        self.state = EngineState::Stepping;
        let outcome = self.session.wait_for_stop()?;
        self.state = EngineState::Stopped;

        // 割り込みで止まった場合、次の入力に備えてその場にトラップを置く
        if let StopOutcome::Paused { pc } = outcome {
            self.arm_trap(pc)?;
        }
        Ok(Step { decoded, outcome })
    }

    /// PCの位置にトラップバイトを置く
    fn arm_trap(&self, pc: u64) -> Result<()> {
        self.session.write_memory(pc, &[TRAP_BYTE])?;
        Ok(())
    }
}
