//! ターゲット内でのシステムコール実行
//!
//! `syscall; int3` のスタブを書き込み、レジスタに引数を積んで再開すると、
//! 子プロセス自身がシステムコールを発行してトラップで戻ってきます。
//! スクラッチ領域の確保や `.alloc` に使います。

use nix::errno::Errno;
use nix::libc::user_regs_struct;

/// `syscall` (0f 05) の直後に INT3
pub const STUB: [u8; 3] = [0x0f, 0x05, crate::TRAP_BYTE];

/// システムコール要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRequest {
    pub number: i64,
    pub args: [u64; 6],
}

impl SyscallRequest {
    /// 匿名プライベートマッピングを確保する `mmap`
    pub fn mmap_anonymous(len: u64, prot: i32) -> Self {
        use nix::libc::{MAP_ANONYMOUS, MAP_PRIVATE, SYS_mmap};
        Self {
            number: SYS_mmap,
            args: [
                0,
                len,
                prot as u64,
                (MAP_PRIVATE | MAP_ANONYMOUS) as u64,
                -1i64 as u64,
                0,
            ],
        }
    }

    /// `site` に置いたスタブを実行するためのレジスタを作る
    ///
    /// 引数は x86_64 のシステムコール規約（rdi, rsi, rdx, r10, r8, r9）に従います。
    pub fn prepare(&self, base: &user_regs_struct, site: u64) -> user_regs_struct {
        let mut regs = *base;
        regs.rip = site;
        regs.rax = self.number as u64;
        regs.rdi = self.args[0];
        regs.rsi = self.args[1];
        regs.rdx = self.args[2];
        regs.r10 = self.args[3];
        regs.r8 = self.args[4];
        regs.r9 = self.args[5];
        regs
    }
}

/// システムコールの戻り値（rax）を解釈する
///
/// -4095..-1 はカーネルが返した errno です。
pub fn decode_return(rax: u64) -> Result<u64, Errno> {
    let value = rax as i64;
    if (-4095..0).contains(&value) {
        Err(Errno::from_raw((-value) as i32))
    } else {
        Ok(rax)
    }
}
