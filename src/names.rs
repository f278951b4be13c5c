//! Lookup keys for team names.
//!
//! Two normalizations are used by the resolver:
//! - exact: lowercase + trim + whitespace collapse
//! - normalized: additionally remove parenthetical suffixes (e.g. "(CA)"),
//!   fold diacritics, turn dashes into spaces and drop other punctuation

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub fn exact_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalized_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut paren_depth: u32 = 0;

    for ch in name.nfkd() {
        match ch {
            '(' => {
                paren_depth += 1;
                continue;
            }
            ')' => {
                paren_depth = paren_depth.saturating_sub(1);
                continue;
            }
            _ if paren_depth > 0 => continue,
            _ if is_combining_mark(ch) => continue,

            // Dashes separate words ("Wisconsin-Milwaukee")
            '-' | '\u{2010}'..='\u{2015}' | '\u{2212}' => out.push(' '),

            // Apostrophes join ("Saint Mary's" == "Saint Marys")
            '\'' | '\u{2018}' | '\u{2019}' | '`' => continue,

            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            c if c.is_whitespace() => out.push(' '),

            // "St." vs "St", "Texas A&M" vs "Texas AM"
            _ => continue,
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drops a trailing word (usually the mascot). Only applies to keys of two
/// or more words.
pub fn without_last_word(key: &str) -> Option<String> {
    let words: Vec<&str> = key.split_whitespace().collect();
    if words.len() < 2 {
        return None;
    }
    Some(words[..words.len() - 1].join(" "))
}
