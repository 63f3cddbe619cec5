//! Per-language word lists and the profanity screen.

use std::collections::{HashMap, HashSet};

use rustrict::CensorStr;

use crate::grid::normalize_word;

#[derive(Debug, Default, Clone)]
pub struct Dictionary {
    languages: HashMap<String, HashSet<String>>,
    blocked: HashSet<String>,
}

impl Dictionary {
    pub fn from_words<'a>(language: &str, words: impl IntoIterator<Item = &'a str>) -> Self {
        let mut dictionary = Self::default();
        dictionary.extend(language, words);
        dictionary
    }

    pub fn extend<'a>(&mut self, language: &str, words: impl IntoIterator<Item = &'a str>) {
        let set = self.languages.entry(language.to_lowercase()).or_default();
        set.extend(
            words
                .into_iter()
                .map(normalize_word)
                .filter(|w| !w.is_empty()),
        );
    }

    /// Adds extra terms to the profanity screen.
    pub fn block<'a>(&mut self, words: impl IntoIterator<Item = &'a str>) {
        self.blocked.extend(
            words
                .into_iter()
                .map(normalize_word)
                .filter(|w| !w.is_empty()),
        );
    }

    /// Case-insensitive lookup. Unknown languages contain nothing.
    pub fn contains(&self, language: &str, word: &str) -> bool {
        self.languages
            .get(&language.to_lowercase())
            .is_some_and(|set| set.contains(&normalize_word(word)))
    }

    pub fn word_count(&self, language: &str) -> usize {
        self.languages
            .get(&language.to_lowercase())
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn is_profane(&self, word: &str) -> bool {
        let normalized = normalize_word(word);
        self.blocked.contains(&normalized) || normalized.as_str().is_inappropriate()
    }
}
