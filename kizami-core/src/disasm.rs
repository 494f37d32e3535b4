//! 逆アセンブル機能
//!
//! 注入したバイト列を逆アセンブルして、実際に何が実行されるかを表示します。

use crate::assemble::Syntax;
use crate::Result;
use capstone::prelude::*;

/// 逆アセンブルした1命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub text: String,
}

impl DecodedInstruction {
    /// `48 c7 c0 01 00 00 00    mov rax, 1` の形式に整形する
    pub fn render(&self) -> String {
        let hex = self
            .bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{:<30} {}", hex, self.text)
    }
}

/// バイト列を逆アセンブルする
///
/// # Arguments
/// * `code` - 命令のバイト列
/// * `base_addr` - 先頭アドレス
/// * `syntax` - 出力する構文
pub fn disassemble(code: &[u8], base_addr: u64, syntax: Syntax) -> Result<Vec<DecodedInstruction>> {
    let cs_syntax = match syntax {
        Syntax::Intel => arch::x86::ArchSyntax::Intel,
        Syntax::Att => arch::x86::ArchSyntax::Att,
    };
    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(cs_syntax)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))?;

    let insns = cs
        .disasm_all(code, base_addr)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble: {}", e))?;

    Ok(insns
        .as_ref()
        .iter()
        .map(|insn| {
            let mnemonic = insn.mnemonic().unwrap_or("");
            let operands = insn.op_str().unwrap_or("");
            let text = if operands.is_empty() {
                mnemonic.to_string()
            } else {
                format!("{} {}", mnemonic, operands)
            };
            DecodedInstruction {
                address: insn.address(),
                bytes: insn.bytes().to_vec(),
                text,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_intel() {
        // mov rax, 1; nop
        let code = vec![0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0x90];
        let insns = disassemble(&code, 0x1000, Syntax::Intel).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].address, 0x1000);
        assert_eq!(insns[0].text, "mov rax, 1");
        assert_eq!(insns[1].address, 0x1007);
        assert_eq!(insns[1].text, "nop");
    }

    #[test]
    fn test_disassemble_att() {
        let insns = disassemble(&[0x31, 0xc0], 0, Syntax::Att).unwrap();
        assert_eq!(insns[0].text, "xorl %eax, %eax");
    }

    #[test]
    fn test_render() {
        let insn = DecodedInstruction {
            address: 0,
            bytes: vec![0x90],
            text: "nop".to_string(),
        };
        assert!(insn.render().starts_with("90 "));
        assert!(insn.render().ends_with(" nop"));
    }
}
