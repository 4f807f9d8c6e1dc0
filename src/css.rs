//! Scoped style rewriting
//!
//! `<style scoped>` blocks get every selector suffixed with the owning
//! document's scope attribute, e.g. `.card h2:hover` becomes
//! `.card h2[data-ncl-1a2b3c4d]:hover`.

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref CSS_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").unwrap();
}

/// At-rules whose bodies hold ordinary rules and are scoped recursively.
const NESTING_AT_RULES: &[&str] = &["@media", "@supports", "@container", "@layer", "@document"];

/// `data-ncl-XXXXXXXX`, from the first eight hex digits of sha256(path).
pub fn scope_attribute(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("data-ncl-{}", &digest[..8])
}

pub fn scope_css(css: &str, attribute: &str) -> String {
    let stripped = CSS_COMMENT.replace_all(css, "");
    scope_rules(&stripped, attribute)
}

fn scope_rules(css: &str, attribute: &str) -> String {
    let mut out = String::new();
    let mut rest = css;

    loop {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            break;
        }
        let Some(open) = trimmed.find(['{', ';']) else {
            out.push_str(trimmed.trim_end());
            break;
        };
        let prelude = trimmed[..open].trim();

        if trimmed[open..].starts_with(';') {
            // `@import url(..);` and friends
            out.push_str(prelude);
            out.push_str(";\n");
            rest = &trimmed[open + 1..];
            continue;
        }

        let Some(close) = matching_brace(&trimmed[open..]).map(|i| i + open) else {
            out.push_str(trimmed.trim_end());
            break;
        };
        let body = &trimmed[open + 1..close];

        if prelude.starts_with('@') {
            let at_name = prelude
                .split(|c: char| c.is_whitespace() || c == '(')
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();
            if NESTING_AT_RULES.contains(&at_name.as_str()) {
                out.push_str(&format!("{} {{\n{}}}\n", prelude, scope_rules(body, attribute)));
            } else {
                out.push_str(&format!("{} {{{}}}\n", prelude, body));
            }
        } else {
            let selectors = split_top_level(prelude, ',')
                .into_iter()
                .map(|s| scope_selector(s, attribute))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("{} {{{}}}\n", selectors, body));
        }
        rest = &trimmed[close + 1..];
    }

    out
}

/// Byte index of the brace matching the `{` at index 0.
fn matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Append `[attribute]` to the last compound selector, before any pseudo.
pub fn scope_selector(selector: &str, attribute: &str) -> String {
    let selector = selector.trim();
    if selector.is_empty() {
        return String::new();
    }

    let mut depth = 0i32;
    let mut last_compound = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ' ' | '\t' | '\n' | '>' | '+' | '~' if depth == 0 => last_compound = i + 1,
            _ => {}
        }
    }

    let compound = &selector[last_compound..];
    let mut depth = 0i32;
    let mut insert_at = selector.len();
    for (i, c) in compound.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ':' if depth == 0 => {
                insert_at = last_compound + i;
                break;
            }
            _ => {}
        }
    }

    format!(
        "{}[{}]{}",
        &selector[..insert_at],
        attribute,
        &selector[insert_at..]
    )
}
