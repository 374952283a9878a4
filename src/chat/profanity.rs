#![forbid(unsafe_code)]

// Profanity filter capability. Pure text-in, verdict-out; no I/O.

/// Result of screening a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfanityVerdict {
    pub contains_profanity: bool,
    pub cleaned_text: String,
}

pub trait ProfanityFilter: Send + Sync {
    fn validate(&self, text: &str) -> ProfanityVerdict;
}

/// Word-list filter: case-insensitive whole-word matches are masked with `*`.
pub struct WordListFilter {
    words: Vec<String>,
}

impl WordListFilter {
    pub fn new(words: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            words: words
                .into_iter()
                .map(|w| w.into().to_lowercase())
                .collect(),
        }
    }
}

impl Default for WordListFilter {
    fn default() -> Self {
        Self::new(["damn", "hell", "crap", "ass", "bastard", "bitch", "shit", "fuck"])
    }
}

impl ProfanityFilter for WordListFilter {
    fn validate(&self, text: &str) -> ProfanityVerdict {
        let mut cleaned = String::with_capacity(text.len());
        let mut contains = false;

        for token in split_keeping_separators(text) {
            match token {
                Token::Word(word) => {
                    if self.words.iter().any(|w| w == &word.to_lowercase()) {
                        contains = true;
                        cleaned.extend(std::iter::repeat('*').take(word.chars().count()));
                    } else {
                        cleaned.push_str(word);
                    }
                }
                Token::Separator(sep) => cleaned.push_str(sep),
            }
        }

        ProfanityVerdict {
            contains_profanity: contains,
            cleaned_text: cleaned,
        }
    }
}

enum Token<'a> {
    Word(&'a str),
    Separator(&'a str),
}

/// Splits into alphabetic runs and everything in between, preserving both.
fn split_keeping_separators(text: &str) -> impl Iterator<Item = Token<'_>> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_word: Option<bool> = None;

    for (idx, ch) in text.char_indices() {
        let is_word = ch.is_alphabetic();
        match in_word {
            Some(prev) if prev == is_word => {}
            Some(prev) => {
                let slice = &text[start..idx];
                tokens.push(if prev {
                    Token::Word(slice)
                } else {
                    Token::Separator(slice)
                });
                start = idx;
                in_word = Some(is_word);
            }
            None => in_word = Some(is_word),
        }
    }
    if start < text.len() {
        let slice = &text[start..];
        tokens.push(match in_word {
            Some(true) => Token::Word(slice),
            _ => Token::Separator(slice),
        });
    }
    tokens.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_passes_through() {
        let filter = WordListFilter::default();
        let verdict = filter.validate("hello there, viewers!");
        assert!(!verdict.contains_profanity);
        assert_eq!(verdict.cleaned_text, "hello there, viewers!");
    }

    #[test]
    fn matched_words_are_masked_case_insensitively() {
        let filter = WordListFilter::default();
        let verdict = filter.validate("what the HELL is this");
        assert!(verdict.contains_profanity);
        assert_eq!(verdict.cleaned_text, "what the **** is this");
    }

    #[test]
    fn substrings_inside_words_are_not_masked() {
        let filter = WordListFilter::default();
        let verdict = filter.validate("hello classic shellfish");
        assert!(!verdict.contains_profanity);
        assert_eq!(verdict.cleaned_text, "hello classic shellfish");
    }

    #[test]
    fn punctuation_boundaries_count_as_word_edges() {
        let filter = WordListFilter::default();
        let verdict = filter.validate("damn!");
        assert!(verdict.contains_profanity);
        assert_eq!(verdict.cleaned_text, "****!");
    }
}
