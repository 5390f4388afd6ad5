// ── Field: Tokenizer ────────────────────────────────────────────────────────
//
// Stateless word/punctuation splitter shared by ingest, presence metrics,
// recall scoring and the generator.
//
// Tokens are runs of Unicode letters (apostrophes allowed inside words) or a
// single punctuation mark from a small fixed set. Ledger tokens are
// lowercased; presence metrics look at the raw casing for emphasis.

use crate::atoms::constants::is_punctuation;
use log::error;
use regex::Regex;
use std::sync::LazyLock;

static TOKEN_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    match Regex::new(r"[\p{L}']+|[.,!?;:—\-]") {
        Ok(re) => Some(re),
        Err(e) => {
            error!("[tokenizer] Failed to compile token pattern: {}", e);
            None
        }
    }
});

fn matches(text: &str) -> impl Iterator<Item = &str> {
    TOKEN_RE
        .as_ref()
        .into_iter()
        .flat_map(move |re| re.find_iter(text).map(|m| m.as_str()))
        .filter(|t| !t.trim_matches('\'').is_empty())
}

/// Split text into ledger tokens (lowercased).
pub fn tokenize(text: &str) -> Vec<String> {
    matches(text).map(str::to_lowercase).collect()
}

/// Split text into tokens preserving the original casing.
pub fn tokenize_raw(text: &str) -> Vec<&str> {
    matches(text).collect()
}

/// Join tokens back into text: punctuation glues to the previous word,
/// dashes stay spaced.
pub fn format_tokens<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    for tok in tokens {
        let tok = tok.as_ref();
        if out.is_empty() {
            out.push_str(tok);
        } else if is_punctuation(tok) && tok != "—" && tok != "-" {
            out.push_str(tok);
        } else {
            out.push(' ');
            out.push_str(tok);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_words_and_punctuation() {
        assert_eq!(
            tokenize("The cat sat on the mat. The cat ran!"),
            vec!["the", "cat", "sat", "on", "the", "mat", ".", "the", "cat", "ran", "!"]
        );
    }

    #[test]
    fn keeps_unicode_letters_and_apostrophes() {
        assert_eq!(tokenize("Ça don't привет"), vec!["ça", "don't", "привет"]);
    }

    #[test]
    fn drops_digits_and_symbols() {
        assert_eq!(tokenize("42 + @ #"), Vec::<String>::new());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn lone_apostrophes_are_not_tokens() {
        assert_eq!(tokenize("' hello '"), vec!["hello"]);
    }

    #[test]
    fn raw_preserves_case() {
        assert_eq!(tokenize_raw("STOP now!"), vec!["STOP", "now", "!"]);
    }

    #[test]
    fn format_attaches_punctuation() {
        let toks = ["hello", ",", "world", "—", "again", "."];
        assert_eq!(format_tokens(&toks), "hello, world — again.");
        assert_eq!(format_tokens::<&str>(&[]), "");
    }
}
