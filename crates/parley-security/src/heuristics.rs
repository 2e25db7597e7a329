//! Cheap character-distribution checks for meaningless input.
//!
//! Everything here is pure and deterministic. A flag is only a hint: the
//! moderation gate decides whether to confirm it with a model.

use std::collections::HashMap;

/// Below this many non-whitespace characters nothing is flagged ("ok", "?").
const MIN_CHARS: usize = 4;
const DOMINANT_MIN_CHARS: usize = 8;
const DOMINANT_RATIO: f64 = 0.6;
const SPECIAL_RATIO: f64 = 0.5;
const UNBROKEN_WORD_LEN: usize = 25;
const VOWEL_MIN_LETTERS: usize = 8;
const VOWEL_RATIO: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonsenseSignal {
    /// One character makes up most of the message ("aaaaaaaaa").
    DominantChar,
    /// Mostly ASCII symbols ("#$%^&*(").
    SpecialChars,
    /// A long run of letters with no spaces at all.
    UnbrokenLetters,
    /// Latin letters with almost no vowels ("sdfghjkl qwrt").
    FewVowels,
}

impl NonsenseSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DominantChar => "dominant_char",
            Self::SpecialChars => "special_chars",
            Self::UnbrokenLetters => "unbroken_letters",
            Self::FewVowels => "few_vowels",
        }
    }
}

/// Returns the first signal that fires, or `None` for plausible text.
pub fn detect_nonsense(text: &str) -> Option<NonsenseSignal> {
    let visible: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    let n = visible.len();
    if n < MIN_CHARS {
        return None;
    }

    if n >= DOMINANT_MIN_CHARS {
        let mut counts: HashMap<char, usize> = HashMap::new();
        for c in &visible {
            *counts.entry(c.to_ascii_lowercase()).or_default() += 1;
        }
        let max = counts.values().copied().max().unwrap_or(0);
        if ratio(max, n) > DOMINANT_RATIO {
            return Some(NonsenseSignal::DominantChar);
        }
    }

    let special = visible
        .iter()
        .filter(|c| c.is_ascii() && !c.is_ascii_alphanumeric())
        .count();
    if ratio(special, n) > SPECIAL_RATIO {
        return Some(NonsenseSignal::SpecialChars);
    }

    // Letter-shape rules only make sense for Latin script.
    if visible.iter().any(|c| c.is_alphabetic() && !c.is_ascii()) {
        return None;
    }

    let trimmed = text.trim();
    if !trimmed.contains(char::is_whitespace)
        && n >= UNBROKEN_WORD_LEN
        && visible.iter().all(|c| c.is_ascii_alphabetic())
    {
        return Some(NonsenseSignal::UnbrokenLetters);
    }

    let letters: Vec<char> = visible
        .iter()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if letters.len() >= VOWEL_MIN_LETTERS {
        let vowels = letters
            .iter()
            .filter(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y'))
            .count();
        if ratio(vowels, letters.len()) < VOWEL_RATIO {
            return Some(NonsenseSignal::FewVowels);
        }
    }

    None
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
