//! Token estimation for budget accounting.
//!
//! Without a tokenizer for the target model, tokens are approximated: each
//! CJK character counts as one token, everything else as
//! `chars_per_token` characters per token (rounded up). The estimate is
//! monotone in prefix length, which budget trimming relies on.

use crate::config::ContextConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimator {
    chars_per_token: usize,
}

impl TokenEstimator {
    #[must_use]
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.chars_per_token)
    }

    #[must_use]
    pub fn estimate(&self, text: &str) -> usize {
        let mut wide = 0usize;
        let mut narrow = 0usize;
        for c in text.chars() {
            if is_cjk(c) {
                wide += 1;
            } else {
                narrow += 1;
            }
        }
        wide + narrow.div_ceil(self.chars_per_token)
    }

    /// Longest prefix of `text` whose estimate fits in `max_tokens`.
    #[must_use]
    pub fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        let mut wide = 0usize;
        let mut narrow = 0usize;
        for (idx, c) in text.char_indices() {
            if is_cjk(c) {
                wide += 1;
            } else {
                narrow += 1;
            }
            if wide + narrow.div_ceil(self.chars_per_token) > max_tokens {
                return &text[..idx];
            }
        }
        text
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

/// CJK ideographs, kana and hangul syllables.
#[must_use]
pub fn is_cjk(c: char) -> bool {
    matches!(
        u32::from(c),
        0x3040..=0x30FF
            | 0x3400..=0x4DBF
            | 0x4E00..=0x9FFF
            | 0xAC00..=0xD7AF
            | 0xF900..=0xFAFF
            | 0xFF66..=0xFF9F
            | 0x20000..=0x2A6DF
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_rounds_up() {
        let est = TokenEstimator::new(4);
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("abc"), 1);
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate("abcde"), 2);
    }

    #[test]
    fn cjk_counts_per_character() {
        let est = TokenEstimator::new(4);
        assert_eq!(est.estimate("灯塔"), 2);
        assert_eq!(est.estimate("灯塔 ok"), 3);
    }

    #[test]
    fn truncate_fits_budget() {
        let est = TokenEstimator::new(4);
        let text = "the keeper climbed the stairs";
        let cut = est.truncate(text, 3);
        assert_eq!(cut, "the keeper c");
        assert!(est.estimate(cut) <= 3);
        assert_eq!(est.truncate(text, 0), "");
        assert_eq!(est.truncate(text, 1_000), text);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let est = TokenEstimator::new(4);
        assert_eq!(est.truncate("海很安静", 2), "海很");
    }

    #[test]
    fn truncate_is_monotone() {
        let est = TokenEstimator::new(3);
        let text = "Mara 看见了 the ship at dawn.";
        let mut previous = 0;
        for budget in 0..20 {
            let len = est.truncate(text, budget).len();
            assert!(len >= previous);
            previous = len;
        }
    }
}
