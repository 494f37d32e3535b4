//! レジスタ・メモリの表示
//!
//! 直前に表示したスナップショットとの差分を強調表示します（表示上の都合だけで、制御には使いません）。

use kizami_target::{RegisterSnapshot, GENERAL_REGISTERS, STATUS_FLAGS, VECTOR_REGISTERS};
use std::fmt::Write as _;

const RESET: &str = "\x1b[0m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const BLUE: &str = "\x1b[34m";

/// 汎用レジスタの1行あたりの列数
const GPR_COLUMNS: usize = 3;

/// ダンプの1行あたりのバイト数
const ROW_BYTES: usize = 8;

/// 表示カテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    General,
    Status,
    VectorHex,
    VectorDouble,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::General,
        Category::Status,
        Category::VectorHex,
        Category::VectorDouble,
    ];

    /// `.show` で使う名前
    pub fn name(&self) -> &'static str {
        match self {
            Category::General => "gpr",
            Category::Status => "status",
            Category::VectorHex => "fpr_hex",
            Category::VectorDouble => "fpr_double",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Category::General => "General purpose registers (rax, rsp, rip, ...)",
            Category::Status => "Status registers (CF, ZF, ...)",
            Category::VectorHex => "Floating point registers shown in hex (xmm0, xmm1, ...)",
            Category::VectorDouble => "Floating point registers shown as doubles",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    fn bit(&self) -> u8 {
        1 << *self as u8
    }
}

/// 表示カテゴリの集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayFilter {
    bits: u8,
}

impl DisplayFilter {
    /// 何も表示しない
    pub fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn is_shown(&self, category: Category) -> bool {
        self.bits & category.bit() != 0
    }

    /// カテゴリを切り替え、切り替え後に表示されるかを返す
    pub fn toggle(&mut self, category: Category) -> bool {
        self.bits ^= category.bit();
        self.is_shown(category)
    }
}

impl Default for DisplayFilter {
    /// 汎用レジスタとステータスフラグを表示する
    fn default() -> Self {
        let mut filter = Self::empty();
        filter.toggle(Category::General);
        filter.toggle(Category::Status);
        filter
    }
}

/// 色付けの有無
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub color: bool,
}

impl Style {
    fn paint(&self, color: &str, text: &str) -> String {
        if self.color {
            format!("{}{}{}", color, text, RESET)
        } else {
            text.to_string()
        }
    }

    fn label(&self, text: &str) -> String {
        self.paint(GREEN, text)
    }

    fn value(&self, text: &str, changed: bool) -> String {
        if changed {
            self.paint(RED, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: &str) -> String {
        self.paint(BLUE, text)
    }
}

/// 差分付きのレジスタ表示
pub struct RegisterView {
    last: Option<RegisterSnapshot>,
    style: Style,
}

impl RegisterView {
    pub fn new(style: Style) -> Self {
        Self { last: None, style }
    }

    /// スナップショットを描画し、次回の差分の基準にする
    pub fn render(&mut self, snapshot: &RegisterSnapshot, filter: DisplayFilter) -> String {
        let text = render_snapshot(snapshot, self.last.as_ref(), filter, self.style);
        self.last = Some(*snapshot);
        text
    }
}

/// スナップショットを描画する
///
/// `last` と値が異なるフィールドを強調します。`last` が `None` なら何も強調しません。
pub fn render_snapshot(
    snapshot: &RegisterSnapshot,
    last: Option<&RegisterSnapshot>,
    filter: DisplayFilter,
    style: Style,
) -> String {
    let mut out = String::from("\n");

    if filter.is_shown(Category::VectorDouble) {
        for (index, name) in VECTOR_REGISTERS.iter().enumerate() {
            let v = snapshot.vector[index];
            let changed =
                |lane: usize| last.is_some_and(|l| l.vector[index].lanes[lane] != v.lanes[lane]);
            let d = v.doubles();
            let _ = writeln!(
                out,
                "{} {{ {}, {} }}",
                style.label(&format!("{:>5}:", name)),
                style.value(&format!("{:.6e}", d[0]), changed(0)),
                style.value(&format!("{:.6e}", d[1]), changed(1)),
            );
        }
    }

    if filter.is_shown(Category::VectorHex) {
        for (index, name) in VECTOR_REGISTERS.iter().enumerate() {
            let v = snapshot.vector[index];
            let changed = last.is_some_and(|l| l.vector[index] != v);
            let _ = writeln!(
                out,
                "{} {}",
                style.label(&format!("{:>5}:", name)),
                style.value(&format!("{:016X}{:016X}", v.lanes[0], v.lanes[1]), changed),
            );
        }
    }

    if filter.is_shown(Category::General) {
        for (index, reg) in GENERAL_REGISTERS.iter().enumerate() {
            let value = snapshot.general[index];
            let changed = last.is_some_and(|l| l.general[index] != value);
            let last_in_row =
                index % GPR_COLUMNS == GPR_COLUMNS - 1 || index == GENERAL_REGISTERS.len() - 1;
            let _ = write!(
                out,
                "{} {}{}",
                style.label(&format!("{:>3}:", reg.name)),
                style.value(&format!("{:016X}", value), changed),
                if last_in_row { "\n" } else { "  " },
            );
        }
    }

    if filter.is_shown(Category::Status) {
        out.push_str(&style.header("Status:"));
        for flag in STATUS_FLAGS.iter() {
            let value = snapshot.flag(flag);
            let changed = last.is_some_and(|l| l.flag(flag) != value);
            let _ = write!(
                out,
                "  {} {}",
                style.label(&format!("{}:", flag.name)),
                style.value(&value.to_string(), changed),
            );
        }
        out.push('\n');
    }

    out
}

/// メモリの16進・ASCIIダンプを作る
///
/// `ADDR: hh hh hh hh hh hh hh hh  ascii` の形式で1行8バイトずつ出力します。
pub fn hexdump(address: u64, data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(ROW_BYTES).enumerate() {
        let mut hex = String::new();
        for slot in 0..ROW_BYTES {
            match chunk.get(slot) {
                Some(b) => {
                    let _ = write!(hex, "{:02X} ", b);
                }
                None => hex.push_str("   "),
            }
        }
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        let _ = writeln!(out, "{:X}: {} {}", address + (row * ROW_BYTES) as u64, hex, ascii);
    }
    out
}
