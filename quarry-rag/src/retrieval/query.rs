//! Query preprocessing for lexical search
//!
//! Full-text queries are reduced to a handful of high-signal terms joined
//! into a conjunctive FTS5 MATCH expression. Tokenization is CJK-aware:
//! ideographic runs carry meaning without whitespace, so they become terms
//! of their own instead of disappearing into punctuation splitting.

use itertools::Itertools;

/// How many query terms survive preprocessing.
pub const MAX_QUERY_TERMS: usize = 3;

/// CJK ranges that never separate on whitespace: unified ideographs and
/// their extensions, kana, and hangul.
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{F900}'..='\u{FAFF}'
            | '\u{3040}'..='\u{30FF}'
            | '\u{AC00}'..='\u{D7AF}'
    )
}

/// Extract up to `max_terms` search terms from a query.
///
/// Alphanumeric runs and CJK runs each become one candidate term. Terms are
/// ranked by length — longer terms carry more signal in a conjunctive
/// query — deduplicated, and truncated. Single-character Latin tokens are
/// dropped unless nothing else survives.
pub fn query_terms(query: &str, max_terms: usize) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_is_cjk = false;

    let mut flush = |current: &mut String| {
        if !current.is_empty() {
            tokens.push(std::mem::take(current).to_lowercase());
        }
    };

    for c in query.chars() {
        if is_cjk(c) {
            if !current.is_empty() && !current_is_cjk {
                flush(&mut current);
            }
            current_is_cjk = true;
            current.push(c);
        } else if c.is_alphanumeric() {
            if !current.is_empty() && current_is_cjk {
                flush(&mut current);
            }
            current_is_cjk = false;
            current.push(c);
        } else {
            flush(&mut current);
        }
    }
    flush(&mut current);

    let filtered: Vec<String> = tokens
        .iter()
        .filter(|t| t.chars().count() >= 2 || t.chars().any(is_cjk))
        .cloned()
        .collect();
    let candidates = if filtered.is_empty() { tokens } else { filtered };

    // Stable sort keeps the original order among equally-long terms.
    candidates
        .into_iter()
        .sorted_by_key(|t| std::cmp::Reverse(t.chars().count()))
        .unique()
        .take(max_terms)
        .collect()
}

/// Join terms into a conjunctive FTS5 MATCH expression.
///
/// Each term is quoted (embedded quotes doubled) so user input can never
/// turn into FTS5 query syntax. Returns `None` for an empty term list.
pub fn match_expression(terms: &[String]) -> Option<String> {
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .join(" AND "),
    )
}
