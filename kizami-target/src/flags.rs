//! RFLAGS のステータスフラグ
//!
//! フラグワードをビットフィールドとして重ねる代わりに、
//! (名前, ビットオフセット, ビット幅) の表を通して読み書きします。

/// フラグワード内の名前付きフィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagField {
    pub name: &'static str,
    pub offset: u32,
    pub width: u32,
}

impl FlagField {
    const fn new(name: &'static str, offset: u32, width: u32) -> Self {
        Self { name, offset, width }
    }

    fn mask(&self) -> u64 {
        ((1u64 << self.width) - 1) << self.offset
    }

    /// フラグワードからフィールドの値を取り出す
    pub fn get(&self, word: u64) -> u64 {
        (word & self.mask()) >> self.offset
    }

    /// フィールドを書き換えたフラグワードを返す
    ///
    /// フィールド幅に収まらない上位ビットは捨てられます。
    pub fn with(&self, word: u64, value: u64) -> u64 {
        (word & !self.mask()) | ((value << self.offset) & self.mask())
    }
}

/// 表示順のステータスフラグ一覧
pub static STATUS_FLAGS: [FlagField; 17] = [
    FlagField::new("CF", 0, 1),
    FlagField::new("PF", 2, 1),
    FlagField::new("AF", 4, 1),
    FlagField::new("ZF", 6, 1),
    FlagField::new("SF", 7, 1),
    FlagField::new("TF", 8, 1),
    FlagField::new("IF", 9, 1),
    FlagField::new("DF", 10, 1),
    FlagField::new("OF", 11, 1),
    FlagField::new("IOPL", 12, 2),
    FlagField::new("NT", 14, 1),
    FlagField::new("RF", 16, 1),
    FlagField::new("VM", 17, 1),
    FlagField::new("AC", 18, 1),
    FlagField::new("VIF", 19, 1),
    FlagField::new("VIP", 20, 1),
    FlagField::new("ID", 21, 1),
];

/// 名前からフラグを検索する
pub fn find(name: &str) -> Option<&'static FlagField> {
    STATUS_FLAGS.iter().find(|f| f.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_flags() {
        // ZF | PF | IF | 予約ビット1
        let word = 0x246;
        assert_eq!(find("ZF").unwrap().get(word), 1);
        assert_eq!(find("PF").unwrap().get(word), 1);
        assert_eq!(find("IF").unwrap().get(word), 1);
        assert_eq!(find("CF").unwrap().get(word), 0);
        assert_eq!(find("IOPL").unwrap().get(word), 0);
    }

    #[test]
    fn test_set_flag_is_idempotent() {
        let cf = find("CF").unwrap();
        let once = cf.with(0x202, 1);
        let twice = cf.with(once, 1);
        assert_eq!(once, 0x203);
        assert_eq!(once, twice);
        assert_eq!(cf.with(twice, 0), 0x202);
    }

    #[test]
    fn test_two_bit_field() {
        let iopl = find("IOPL").unwrap();
        let word = iopl.with(0, 3);
        assert_eq!(word, 0x3000);
        assert_eq!(iopl.get(word), 3);
        // 幅を超えるビットは書き込まれない
        assert_eq!(iopl.with(0, 0b111), 0x3000);
    }

    #[test]
    fn test_unknown_flag() {
        assert!(find("XF").is_none());
        assert!(find("cf").is_none());
    }

    #[test]
    fn test_fields_do_not_overlap() {
        let mut seen = 0u64;
        for flag in STATUS_FLAGS.iter() {
            assert_eq!(seen & flag.mask(), 0, "{} overlaps", flag.name);
            seen |= flag.mask();
        }
    }
}
