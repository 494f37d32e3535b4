//! レジスタアクセス機能
//!
//! 汎用レジスタ・XMMレジスタ・ステータスフラグを名前で引ける1つの表にまとめ、
//! アクセサと表示・ヘルプの両方がこの表を参照します。

use crate::flags::{self, FlagField};
use crate::Result;
use anyhow::Context as _;
use nix::errno::Errno;
use nix::libc::{self, user_fpregs_struct, user_regs_struct};
use nix::unistd::Pid;
use std::mem::MaybeUninit;
use thiserror::Error;

/// 汎用レジスタの数
pub const GPR_COUNT: usize = 21;

/// XMMレジスタの数
pub const VECTOR_COUNT: usize = 16;

type Slot = fn(&mut user_regs_struct) -> &mut u64;

/// 汎用レジスタの定義
pub struct GeneralRegister {
    pub name: &'static str,
    slot: Slot,
}

/// 汎用レジスタ表（表示順）
pub static GENERAL_REGISTERS: [GeneralRegister; GPR_COUNT] = [
    GeneralRegister { name: "rax", slot: |r| &mut r.rax },
    GeneralRegister { name: "rbx", slot: |r| &mut r.rbx },
    GeneralRegister { name: "rcx", slot: |r| &mut r.rcx },
    GeneralRegister { name: "rdx", slot: |r| &mut r.rdx },
    GeneralRegister { name: "rdi", slot: |r| &mut r.rdi },
    GeneralRegister { name: "rsi", slot: |r| &mut r.rsi },
    GeneralRegister { name: "rbp", slot: |r| &mut r.rbp },
    GeneralRegister { name: "rsp", slot: |r| &mut r.rsp },
    GeneralRegister { name: "r8", slot: |r| &mut r.r8 },
    GeneralRegister { name: "r9", slot: |r| &mut r.r9 },
    GeneralRegister { name: "r10", slot: |r| &mut r.r10 },
    GeneralRegister { name: "r11", slot: |r| &mut r.r11 },
    GeneralRegister { name: "r12", slot: |r| &mut r.r12 },
    GeneralRegister { name: "r13", slot: |r| &mut r.r13 },
    GeneralRegister { name: "r14", slot: |r| &mut r.r14 },
    GeneralRegister { name: "r15", slot: |r| &mut r.r15 },
    GeneralRegister { name: "rip", slot: |r| &mut r.rip },
    GeneralRegister { name: "rflags", slot: |r| &mut r.eflags },
    GeneralRegister { name: "cs", slot: |r| &mut r.cs },
    GeneralRegister { name: "fs", slot: |r| &mut r.fs },
    GeneralRegister { name: "gs", slot: |r| &mut r.gs },
];

/// プログラムカウンタ（RIP）の表インデックス
pub const PC_INDEX: usize = 16;

/// RFLAGS の表インデックス
pub const FLAGS_INDEX: usize = 17;

/// XMMレジスタ名（表示順）
pub static VECTOR_REGISTERS: [&str; VECTOR_COUNT] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

/// レジスタ名の解決結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterLocation {
    /// 汎用レジスタ（表インデックス）
    General(usize),
    /// XMMレジスタ（番号）
    Vector(usize),
    /// RFLAGS 内のフィールド
    Flag(&'static FlagField),
}

impl RegisterLocation {
    /// レジスタ名を格納場所に解決する
    ///
    /// 汎用レジスタ、XMMレジスタ、ステータスフラグの順に検索します。
    pub fn resolve(name: &str) -> Option<Self> {
        if let Some(index) = GENERAL_REGISTERS.iter().position(|r| r.name == name) {
            return Some(Self::General(index));
        }
        if let Some(index) = VECTOR_REGISTERS.iter().position(|r| *r == name) {
            return Some(Self::Vector(index));
        }
        flags::find(name).map(Self::Flag)
    }

    /// 書き込める最大バイト数
    pub fn width(&self) -> usize {
        match self {
            Self::General(_) => 8,
            Self::Vector(_) => 16,
            Self::Flag(_) => 1,
        }
    }
}

/// レジスタへの代入エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignError {
    #[error("value is {got} bytes but the register holds {max}")]
    TooWide { max: usize, got: usize },
    #[error("flag value must be 0 or 1")]
    InvalidFlagValue,
}

/// 128ビットのXMMレジスタ
///
/// `lanes[0]` がメモリ上の下位8バイト、`lanes[1]` が上位8バイトです。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VectorRegister {
    pub lanes: [u64; 2],
}

impl VectorRegister {
    /// 入力バイト列（ビッグエンディアン表記）から作成する
    ///
    /// 入力の末尾8バイトが `lanes[1]` に、残りが `lanes[0]` に右詰めで入ります。
    /// 16進表示（lanes[0], lanes[1] の順）で入力がそのまま再現されます。
    pub fn from_input(bytes: &[u8]) -> std::result::Result<Self, AssignError> {
        if bytes.len() > 16 {
            return Err(AssignError::TooWide { max: 16, got: bytes.len() });
        }
        let mut padded = [0u8; 16];
        padded[16 - bytes.len()..].copy_from_slice(bytes);
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&padded[..8]);
        high.copy_from_slice(&padded[8..]);
        Ok(Self {
            lanes: [u64::from_be_bytes(low), u64::from_be_bytes(high)],
        })
    }

    /// 2つの倍精度浮動小数点数として見る
    pub fn doubles(&self) -> [f64; 2] {
        [f64::from_bits(self.lanes[0]), f64::from_bits(self.lanes[1])]
    }

    fn from_words(words: &[u32]) -> Self {
        let lane = |lo: u32, hi: u32| (lo as u64) | ((hi as u64) << 32);
        Self {
            lanes: [lane(words[0], words[1]), lane(words[2], words[3])],
        }
    }

    fn store_words(&self, words: &mut [u32]) {
        words[0] = self.lanes[0] as u32;
        words[1] = (self.lanes[0] >> 32) as u32;
        words[2] = self.lanes[1] as u32;
        words[3] = (self.lanes[1] >> 32) as u32;
    }
}

/// レジスタのスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    /// `GENERAL_REGISTERS` と同じ順の汎用レジスタ値
    pub general: [u64; GPR_COUNT],
    /// XMMレジスタ
    pub vector: [VectorRegister; VECTOR_COUNT],
}

impl Default for RegisterSnapshot {
    fn default() -> Self {
        Self {
            general: [0; GPR_COUNT],
            vector: [VectorRegister::default(); VECTOR_COUNT],
        }
    }
}

impl RegisterSnapshot {
    /// プログラムカウンタ
    pub fn pc(&self) -> u64 {
        self.general[PC_INDEX]
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.general[PC_INDEX] = pc;
    }

    /// フラグワード
    pub fn flags(&self) -> u64 {
        self.general[FLAGS_INDEX]
    }

    /// フラグフィールドの値
    pub fn flag(&self, field: &FlagField) -> u64 {
        field.get(self.flags())
    }

    /// 汎用レジスタを名前で読む
    pub fn general_by_name(&self, name: &str) -> Option<u64> {
        match RegisterLocation::resolve(name)? {
            RegisterLocation::General(index) => Some(self.general[index]),
            _ => None,
        }
    }

    /// レジスタにバイト列（ビッグエンディアン表記）を代入する
    ///
    /// 汎用レジスタは0クリアの後に右詰め、XMMレジスタは `VectorRegister::from_input` の規則に従います。
    /// フラグには 0 または 1 の1バイトのみ代入できます。
    pub fn assign(
        &mut self,
        location: RegisterLocation,
        bytes: &[u8],
    ) -> std::result::Result<(), AssignError> {
        match location {
            RegisterLocation::General(index) => {
                if bytes.len() > 8 {
                    return Err(AssignError::TooWide { max: 8, got: bytes.len() });
                }
                let mut padded = [0u8; 8];
                padded[8 - bytes.len()..].copy_from_slice(bytes);
                self.general[index] = u64::from_be_bytes(padded);
            }
            RegisterLocation::Vector(index) => {
                self.vector[index] = VectorRegister::from_input(bytes)?;
            }
            RegisterLocation::Flag(field) => {
                let value = match bytes {
                    [v @ (0 | 1)] => *v as u64,
                    _ => return Err(AssignError::InvalidFlagValue),
                };
                self.general[FLAGS_INDEX] = field.with(self.flags(), value);
            }
        }
        Ok(())
    }

    fn from_raw(regs: &user_regs_struct, fp: &user_fpregs_struct) -> Self {
        let mut regs = *regs;
        let mut snapshot = Self::default();
        for (value, def) in snapshot.general.iter_mut().zip(GENERAL_REGISTERS.iter()) {
            *value = *(def.slot)(&mut regs);
        }
        for (index, vector) in snapshot.vector.iter_mut().enumerate() {
            *vector = VectorRegister::from_words(&fp.xmm_space[index * 4..index * 4 + 4]);
        }
        snapshot
    }

    fn store_general(&self, regs: &mut user_regs_struct) {
        for (value, def) in self.general.iter().zip(GENERAL_REGISTERS.iter()) {
            *(def.slot)(regs) = *value;
        }
    }

    fn store_vector(&self, fp: &mut user_fpregs_struct) {
        for (index, vector) in self.vector.iter().enumerate() {
            vector.store_words(&mut fp.xmm_space[index * 4..index * 4 + 4]);
        }
    }
}

/// 制御対象スレッドのレジスタアクセス
///
/// ptrace の要求はトレーサスレッドからのみ受け付けられるため、
/// コントローラスレッドだけがこの型を使います。
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: i32) -> Self {
        Self {
            pid: Pid::from_raw(tid),
        }
    }

    /// 汎用レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        nix::sys::ptrace::getregs(self.pid).context("PTRACE_GETREGS")
    }

    /// 汎用レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs).context("PTRACE_SETREGS")
    }

    /// 浮動小数点・SSEレジスタを読み取る
    pub fn read_fp(&self) -> Result<user_fpregs_struct> {
        let mut fp = MaybeUninit::<user_fpregs_struct>::zeroed();
        // SAFETY: カーネルが user_fpregs_struct 全体を書き込む
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETFPREGS,
                self.pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                fp.as_mut_ptr() as *mut libc::c_void,
            )
        };
        Errno::result(ret).context("PTRACE_GETFPREGS")?;
        // SAFETY: 呼び出しが成功したので初期化済み（失敗時もゼロ初期化済み）
        Ok(unsafe { fp.assume_init() })
    }

    /// 浮動小数点・SSEレジスタに書き込む
    pub fn write_fp(&self, fp: &user_fpregs_struct) -> Result<()> {
        // SAFETY: カーネルは fp を読むだけ
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETFPREGS,
                self.pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                fp as *const user_fpregs_struct as *mut libc::c_void,
            )
        };
        Errno::result(ret).context("PTRACE_SETFPREGS")?;
        Ok(())
    }

    /// 全レジスタのスナップショットを取る
    pub fn snapshot(&self) -> Result<RegisterSnapshot> {
        let regs = self.read()?;
        let fp = self.read_fp()?;
        Ok(RegisterSnapshot::from_raw(&regs, &fp))
    }

    /// スナップショットをスレッドに書き戻す
    ///
    /// 表に載っていないレジスタ（orig_rax, fs_base など）は現在の値が保たれます。
    pub fn write_snapshot(&self, snapshot: &RegisterSnapshot) -> Result<()> {
        let mut regs = self.read()?;
        snapshot.store_general(&mut regs);
        self.write(regs)?;

        let mut fp = self.read_fp()?;
        snapshot.store_vector(&mut fp);
        self.write_fp(&fp)
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        let regs = self.read()?;
        Ok(regs.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }

    /// プログラムカウンタを巻き戻す
    ///
    /// INT3 で停止した直後の RIP はトラップバイトの次を指しているため、
    /// 1バイト戻してトラップバイト自身を指すようにします。
    pub fn rewind_pc(&self, bytes: u64) -> Result<u64> {
        let pc = self.get_pc()?.wrapping_sub(bytes);
        self.set_pc(pc)?;
        Ok(pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_names() {
        assert_eq!(RegisterLocation::resolve("rax"), Some(RegisterLocation::General(0)));
        assert_eq!(RegisterLocation::resolve("rip"), Some(RegisterLocation::General(PC_INDEX)));
        assert_eq!(
            RegisterLocation::resolve("rflags"),
            Some(RegisterLocation::General(FLAGS_INDEX))
        );
        assert_eq!(RegisterLocation::resolve("xmm15"), Some(RegisterLocation::Vector(15)));
        match RegisterLocation::resolve("ZF") {
            Some(RegisterLocation::Flag(f)) => assert_eq!(f.offset, 6),
            other => panic!("Expected flag, got {:?}", other),
        }
        assert_eq!(RegisterLocation::resolve("eax"), None);
        assert_eq!(RegisterLocation::resolve("xmm16"), None);
    }

    #[test]
    fn test_assign_general_right_aligned() {
        let mut snap = RegisterSnapshot::default();
        let rbx = RegisterLocation::resolve("rbx").unwrap();
        snap.general[1] = u64::MAX;
        snap.assign(rbx, &[0x12, 0x34]).unwrap();
        assert_eq!(snap.general[1], 0x1234);

        snap.assign(rbx, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(snap.general[1], 0x0102030405060708);
    }

    #[test]
    fn test_assign_general_too_wide() {
        let mut snap = RegisterSnapshot::default();
        let rax = RegisterLocation::resolve("rax").unwrap();
        snap.general[0] = 7;
        assert_eq!(
            snap.assign(rax, &[0; 9]),
            Err(AssignError::TooWide { max: 8, got: 9 })
        );
        assert_eq!(snap.general[0], 7);
    }

    #[test]
    fn test_assign_vector_byte_order() {
        let mut snap = RegisterSnapshot::default();
        let xmm1 = RegisterLocation::resolve("xmm1").unwrap();

        snap.assign(xmm1, &[0x11, 0x22]).unwrap();
        assert_eq!(snap.vector[1].lanes, [0, 0x1122]);

        let input: Vec<u8> = (1..=10).collect();
        snap.assign(xmm1, &input).unwrap();
        assert_eq!(snap.vector[1].lanes, [0x0102, 0x030405060708090a]);

        assert!(snap.assign(xmm1, &[0; 17]).is_err());
    }

    #[test]
    fn test_assign_flag() {
        let mut snap = RegisterSnapshot::default();
        snap.general[FLAGS_INDEX] = 0x202;
        let cf = RegisterLocation::resolve("CF").unwrap();
        snap.assign(cf, &[1]).unwrap();
        snap.assign(cf, &[1]).unwrap();
        assert_eq!(snap.flags(), 0x203);
        assert_eq!(snap.assign(cf, &[2]), Err(AssignError::InvalidFlagValue));
        assert_eq!(snap.flags(), 0x203);
    }

    #[test]
    fn test_vector_views() {
        let v = VectorRegister {
            lanes: [1.5f64.to_bits(), (-2.0f64).to_bits()],
        };
        assert_eq!(v.doubles(), [1.5, -2.0]);
    }

    #[test]
    fn test_vector_words_round_trip() {
        let v = VectorRegister {
            lanes: [0x1122334455667788, 0x99aabbccddeeff00],
        };
        let mut words = [0u32; 4];
        v.store_words(&mut words);
        assert_eq!(words, [0x55667788, 0x11223344, 0xddeeff00, 0x99aabbcc]);
        assert_eq!(VectorRegister::from_words(&words), v);
    }

    #[test]
    fn test_general_by_name() {
        let mut snap = RegisterSnapshot::default();
        snap.set_pc(0x7000);
        assert_eq!(snap.general_by_name("rip"), Some(0x7000));
        assert_eq!(snap.pc(), 0x7000);
        assert_eq!(snap.general_by_name("xmm0"), None);
        assert_eq!(snap.general_by_name("nope"), None);
    }
}
