//! Answer completeness classification.
//!
//! Detecting an answer that the remote peer cut off mid-thought is language specific:
//! terminal punctuation and "dangling function word" rules only make sense for English.
//! Each language gets its own [`CompletenessClassifier`]; languages without one are always
//! treated as complete.

use serde::Serialize;

/// Language tag attached to delivered answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    Korean,
    Japanese,
    Chinese,
    Cyrillic,
    Unknown,
}

impl Language {
    /// BCP-47-ish tag.
    pub fn as_tag(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Korean => "ko",
            Language::Japanese => "ja",
            Language::Chinese => "zh",
            Language::Cyrillic => "ru",
            Language::Unknown => "und",
        }
    }

    /// Script-majority detection. Kana anywhere wins over Han for Japanese.
    pub fn detect(text: &str) -> Language {
        let (mut latin, mut hangul, mut kana, mut han, mut cyrillic) = (0usize, 0, 0, 0, 0);
        for c in text.chars() {
            match c {
                'a'..='z' | 'A'..='Z' => latin += 1,
                '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}' | '\u{3130}'..='\u{318F}' => {
                    hangul += 1
                }
                '\u{3040}'..='\u{30FF}' => kana += 1,
                '\u{4E00}'..='\u{9FFF}' => han += 1,
                '\u{0400}'..='\u{04FF}' => cyrillic += 1,
                _ => {}
            }
        }

        if kana > 0 && kana + han >= hangul.max(latin / 4) {
            return Language::Japanese;
        }
        let best = [
            (latin, Language::English),
            (hangul * 2, Language::Korean),
            (han * 2, Language::Chinese),
            (cyrillic, Language::Cyrillic),
        ]
        .into_iter()
        .max_by_key(|(count, _)| *count);

        match best {
            Some((count, lang)) if count > 0 => lang,
            _ => Language::Unknown,
        }
    }
}

/// Verdict of a completeness classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    PossiblyIncomplete,
}

/// Swappable text -> completeness function for one language.
pub trait CompletenessClassifier: Send + Sync {
    /// The language this classifier is scoped to.
    fn language(&self) -> Language;

    fn classify(&self, text: &str) -> Completeness;
}

const FUNCTION_WORDS: &[&str] = &[
    // articles
    "a", "an", "the",
    // conjunctions
    "and", "but", "or", "nor", "so", "yet", "because", "although", "though", "while",
    "if", "unless", "since", "whereas", "that", "which", "than",
    // prepositions
    "about", "above", "across", "after", "against", "along", "among", "around", "as", "at",
    "before", "behind", "below", "beneath", "beside", "between", "beyond", "by", "despite",
    "during", "except", "for", "from", "in", "inside", "into", "like", "near", "of", "off",
    "on", "onto", "out", "over", "past", "through", "throughout", "to", "toward", "towards",
    "under", "until", "upon", "with", "within", "without",
];

const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?', '…', '"', '\'', ')', ':', ';', '”', '’'];

/// English heuristic: non-trivial text, no terminal punctuation, ends on a function word.
#[derive(Debug, Clone)]
pub struct EnglishTailClassifier {
    min_chars: usize,
}

impl EnglishTailClassifier {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }
}

impl Default for EnglishTailClassifier {
    fn default() -> Self {
        Self::new(3)
    }
}

impl CompletenessClassifier for EnglishTailClassifier {
    fn language(&self) -> Language {
        Language::English
    }

    fn classify(&self, text: &str) -> Completeness {
        let trimmed = text.trim();
        if trimmed.chars().filter(|c| c.is_alphanumeric()).count() < self.min_chars {
            return Completeness::Complete;
        }
        if trimmed.ends_with(TERMINAL_PUNCTUATION) {
            return Completeness::Complete;
        }
        let last_word = trimmed
            .rsplit(|c: char| c.is_whitespace())
            .next()
            .unwrap_or_default()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if FUNCTION_WORDS.contains(&last_word.as_str()) {
            Completeness::PossiblyIncomplete
        } else {
            Completeness::Complete
        }
    }
}

/// Routes an answer to the classifier of its detected language.
pub struct ClassifierSet {
    classifiers: Vec<Box<dyn CompletenessClassifier>>,
}

impl ClassifierSet {
    pub fn new(classifiers: Vec<Box<dyn CompletenessClassifier>>) -> Self {
        Self { classifiers }
    }

    /// Default set: English only.
    pub fn english(min_chars: usize) -> Self {
        Self::new(vec![Box::new(EnglishTailClassifier::new(min_chars))])
    }

    pub fn classify(&self, text: &str, language: Language) -> Completeness {
        self.classifiers
            .iter()
            .find(|c| c.language() == language)
            .map(|c| c.classify(text))
            .unwrap_or(Completeness::Complete)
    }
}

impl std::fmt::Debug for ClassifierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let languages: Vec<Language> = self.classifiers.iter().map(|c| c.language()).collect();
        f.debug_struct("ClassifierSet").field("languages", &languages).finish()
    }
}
