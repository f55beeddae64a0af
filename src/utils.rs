//! 字符安全的截断工具（按 char 而非字节，避免切断多字节字符）

/// 取前 max 个字符
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// 超过 max 个字符时截断并追加 suffix
pub fn truncate_with(s: &str, max: usize, suffix: &str) -> String {
    if s.chars().count() > max {
        format!("{}{}", truncate_chars(s, max), suffix)
    } else {
        s.to_string()
    }
}

/// 取最后 max 个字符
pub fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
