//! Reviewer approval detection.
//!
//! A reviewer signs off by including the literal token `@@SIGNED OFF@@`
//! (matched case-insensitively). A word-bounded `no`, `not`, or `never`
//! earlier on the same line negates that occurrence; a later clean
//! occurrence still approves. Detection failure counts as not approved.

use std::sync::LazyLock;

use regex::Regex;

/// The literal approval token reviewers are instructed to emit.
pub const APPROVAL_TOKEN: &str = "@@SIGNED OFF@@";

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)@@SIGNED OFF@@").expect("approval token regex should compile")
});

static NEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:no|not|never)\b").expect("negation regex should compile")
});

/// Whether reviewer output constitutes an approval.
pub fn is_approved(content: &str) -> bool {
    for token in TOKEN_RE.find_iter(content) {
        let line_start = content[..token.start()]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let line_prefix = &content[line_start..token.start()];
        if !NEGATION_RE.is_match(line_prefix) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_approval() {
        assert!(is_approved("@@SIGNED OFF@@"));
        assert!(is_approved("Great work.\n@@SIGNED OFF@@"));
        assert!(is_approved("Looks solid. @@SIGNED OFF@@ Ship it."));
    }

    #[test]
    fn test_case_insensitive_token() {
        assert!(is_approved("@@signed off@@"));
        assert!(is_approved("@@Signed Off@@"));
    }

    #[test]
    fn test_adjacent_negations() {
        assert!(!is_approved("NOT @@SIGNED OFF@@"));
        assert!(!is_approved("NOT  @@SIGNED OFF@@"));
        assert!(!is_approved("NOT@@SIGNED OFF@@"));
        assert!(!is_approved("NO @@SIGNED OFF@@"));
        assert!(!is_approved("Never @@SIGNED OFF@@"));
        assert!(!is_approved("never  @@SIGNED OFF@@"));
    }

    #[test]
    fn test_negation_earlier_on_line() {
        assert!(!is_approved("We do NOT consider this @@SIGNED OFF@@"));
        assert!(!is_approved("This is not ready for @@SIGNED OFF@@"));
    }

    #[test]
    fn test_negation_on_earlier_line_does_not_block() {
        assert!(is_approved(
            "The first draft was not acceptable.\nThis revision is ready.\n@@SIGNED OFF@@"
        ));
    }

    #[test]
    fn test_negation_like_words_do_not_block() {
        // "Note" and "nothing" contain negation substrings but are not
        // word-bounded negations.
        assert!(is_approved("Note: @@SIGNED OFF@@"));
        assert!(is_approved("Nothing left to fix. @@SIGNED OFF@@"));
    }

    #[test]
    fn test_later_clean_occurrence_approves() {
        assert!(is_approved(
            "I will not say @@SIGNED OFF@@ lightly.\nBut now: @@SIGNED OFF@@"
        ));
    }

    #[test]
    fn test_no_token_means_no_approval() {
        assert!(!is_approved(""));
        assert!(!is_approved("Please revise the second paragraph."));
        assert!(!is_approved("@@SIGNED@@ is not the token"));
    }
}
