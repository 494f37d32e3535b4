//! パース関連のユーティリティ関数

use anyhow::Result;
use kizami_target::RegisterSnapshot;

/// 数値文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポートします。
/// 負の10進数は2の補数として扱います。
///
/// # Examples
/// ```
/// use kizami_core::parse::parse_number;
///
/// assert_eq!(parse_number("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_number("1234").unwrap(), 1234);
/// assert_eq!(parse_number("-1").unwrap(), u64::MAX);
/// ```
pub fn parse_number(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        // 16進数
        u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal number '{}': {}", s, e))
    } else if s.starts_with('-') {
        s.parse::<i64>()
            .map(|v| v as u64)
            .map_err(|e| anyhow::anyhow!("Invalid number '{}': {}", s, e))
    } else {
        s.parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid number '{}': {}", s, e))
    }
}

/// アドレス引数を解決する
///
/// 数値として解釈できなければ汎用レジスタ名として現在の値を使います。
pub fn resolve_value(token: &str, snapshot: &RegisterSnapshot) -> Option<u64> {
    parse_number(token)
        .ok()
        .or_else(|| snapshot.general_by_name(token))
}

/// 16進文字列をバイト列に変換する
///
/// `allow_odd` が真なら奇数桁を許し、先頭に0を補います（`.set` 用）。
/// 偽なら2桁ずつの組でなければエラーです（`.write` 用）。
pub fn parse_hex_bytes(s: &str, allow_odd: bool) -> Result<Vec<u8>> {
    let s = s.trim();
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);

    if digits.is_empty() {
        anyhow::bail!("Empty hex string");
    }
    if digits.len() % 2 != 0 && !allow_odd {
        anyhow::bail!("Hex string '{}' is not made of pairs", s);
    }

    let nibbles = digits
        .chars()
        .map(|c| {
            c.to_digit(16)
                .map(|d| d as u8)
                .ok_or_else(|| anyhow::anyhow!("Invalid hex digit '{}' in '{}'", c, s))
        })
        .collect::<Result<Vec<u8>>>()?;

    let mut bytes = Vec::with_capacity(nibbles.len() / 2 + 1);
    let mut rest = nibbles.as_slice();
    if rest.len() % 2 != 0 {
        bytes.push(rest[0]);
        rest = &rest[1..];
    }
    for pair in rest.chunks(2) {
        bytes.push(pair[0] << 4 | pair[1]);
    }
    Ok(bytes)
}
