//! 分词模块
//!
//! 记忆检索用的轻量分词：小写后按「单词 | 单个标点」切分，
//! 并去掉 SentencePiece / BPE 的子词前缀（`▁`、`Ġ`），保证同一句话在不同来源下得到相同 n-gram。

use std::sync::LazyLock;

use regex::Regex;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+|[^\w\s]").expect("Invalid token regex"));

/// 规范化单个 token：去空白、去子词标记、小写
pub fn normalize_token(token: &str) -> String {
    token
        .trim()
        .replace(['▁', 'Ġ'], "")
        .to_lowercase()
}

/// 分词：小写 -> 正则切分 -> 规范化 -> 丢弃空 token
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lowered)
        .map(|m| normalize_token(m.as_str()))
        .filter(|t| !t.is_empty())
        .collect()
}
