//! メモリアクセス機能

use crate::Result;
use anyhow::Context as _;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::fs::FileExt;

/// 1回の読み取りで返す最大バイト数
pub const MAX_READ_LEN: usize = 1 << 20;

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl MemoryMapping {
    /// アドレスがこのマッピングに含まれるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// `/proc/pid/maps` の1行をパースする
    ///
    /// フォーマット: "address perms offset dev inode pathname"
    /// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let (start, end) = parts.next()?.split_once('-')?;
        let perms = parts.next()?.as_bytes();
        if perms.len() < 3 {
            return None;
        }

        Some(Self {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            readable: perms[0] == b'r',
            writable: perms[1] == b'w',
            executable: perms[2] == b'x',
        })
    }
}

/// ターゲットプロセスの仮想メモリアクセス
///
/// `/proc/pid/mem` を使うため、ページ保護に関係なく読み書きできます。
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    fn open(&self, write: bool) -> Result<File> {
        let mem_path = self.mem_path();
        OpenOptions::new()
            .read(!write)
            .write(write)
            .open(&mem_path)
            .with_context(|| format!("Failed to open {}", mem_path))
    }

    /// 読み取れる分だけメモリを読み取る
    ///
    /// 未マッピング領域に達した時点で読み取りを打ち切り、それまでのバイト列を返します。
    /// `MAX_READ_LEN` を超える要求は切り詰められます。
    /// 1バイトも読めなかった場合はエラーを返します。
    pub fn read_available(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let file = self.open(false)?;
        let size = size.min(MAX_READ_LEN);
        let mut buffer = vec![0u8; size];
        let mut filled = 0;

        while filled < size {
            match file.read_at(&mut buffer[filled..], addr + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if filled == 0 => {
                    return Err(e).with_context(|| format!("Failed to read memory at 0x{:x}", addr));
                }
                Err(_) => break,
            }
        }

        if filled == 0 && size > 0 {
            anyhow::bail!("Failed to read memory at 0x{:x}: nothing readable", addr);
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// メモリからデータを読み取る（全バイト必須）
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let data = self.read_available(addr, size)?;
        if data.len() != size {
            anyhow::bail!(
                "Short read at 0x{:x}: {} of {} bytes",
                addr,
                data.len(),
                size
            );
        }
        Ok(data)
    }

    /// メモリにデータを書き込む
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let file = self.open(true)?;
        file.write_all_at(data, addr)
            .with_context(|| format!("Failed to write {} bytes to 0x{:x}", data.len(), addr))
    }

    /// u8値を書き込む
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .with_context(|| format!("Failed to open {}", maps_path))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            if let Some(mapping) = MemoryMapping::parse(&line?) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// 指定されたアドレスを含むマッピングを取得する
    pub fn mapping_containing(&self, addr: u64) -> Result<Option<MemoryMapping>> {
        Ok(self.mappings()?.into_iter().find(|m| m.contains(addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mapping() {
        let line = "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so";
        let m = MemoryMapping::parse(line).unwrap();
        assert_eq!(m.start, 0x7f1234567000);
        assert_eq!(m.end, 0x7f1234568000);
        assert!(m.readable && !m.writable && m.executable);
        assert!(m.contains(0x7f1234567fff));
        assert!(!m.contains(0x7f1234568000));
    }

    #[test]
    fn test_parse_anonymous_rwx() {
        let m = MemoryMapping::parse("7f0000000000-7f0000010000 rwxp 00000000 00:00 0").unwrap();
        assert!(m.readable && m.writable && m.executable);
    }

    #[test]
    fn test_parse_invalid_mapping() {
        assert!(MemoryMapping::parse("").is_none());
        assert!(MemoryMapping::parse("zzzz-0000 rw-p").is_none());
        assert!(MemoryMapping::parse("1000-2000 r").is_none());
    }

    #[test]
    fn test_read_own_memory() {
        let data = [0xde, 0xad, 0xbe, 0xef];
        let memory = Memory::new(std::process::id() as i32);
        let read = memory.read(data.as_ptr() as u64, data.len()).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_own_mappings_contain_stack() {
        let local = 0u64;
        let memory = Memory::new(std::process::id() as i32);
        let mapping = memory.mapping_containing(&local as *const u64 as u64).unwrap();
        assert!(mapping.map_or(false, |m| m.readable && m.writable));
    }
}
