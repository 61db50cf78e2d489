//! Lexical segmentation shared by sparse indexing and sparse queries.
//!
//! Words come from Unicode word boundaries (UAX #29) and are lowercased.
//! Scripts written without spaces between words (Han, kana, hangul) are
//! collected into runs and emitted as unigrams plus overlapping bigrams, so
//! a query like "杨梅" matches text containing "杨梅酒" without a dictionary.

use unicode_segmentation::UnicodeSegmentation;

/// Split text into index terms.
pub fn segment(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut run: Vec<char> = Vec::new();

    for piece in text.split_word_bounds() {
        if piece.chars().all(is_cjk) {
            run.extend(piece.chars());
            continue;
        }
        flush_run(&mut run, &mut terms);
        if piece.chars().any(char::is_alphanumeric) {
            terms.push(piece.to_lowercase());
        }
    }
    flush_run(&mut run, &mut terms);
    terms
}

fn flush_run(run: &mut Vec<char>, terms: &mut Vec<String>) {
    terms.extend(run.iter().map(|c| c.to_string()));
    terms.extend(run.windows(2).map(|pair| pair.iter().collect::<String>()));
    run.clear();
}

/// Characters from scripts without whitespace word boundaries.
fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x309F     // Hiragana
        | 0x30A0..=0x30FF   // Katakana
        | 0x31F0..=0x31FF   // Katakana phonetic extensions
        | 0x3400..=0x4DBF   // CJK extension A
        | 0x4E00..=0x9FFF   // CJK unified ideographs
        | 0xF900..=0xFAFF   // CJK compatibility ideographs
        | 0x1100..=0x11FF   // Hangul jamo
        | 0x3130..=0x318F   // Hangul compatibility jamo
        | 0xAC00..=0xD7AF   // Hangul syllables
        | 0x20000..=0x2EBEF // CJK extensions B-F
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin_words_are_lowercased() {
        assert_eq!(
            segment("The quick, brown FOX's den!"),
            vec!["the", "quick", "brown", "fox's", "den"]
        );
    }

    #[test]
    fn test_numbers_are_terms() {
        assert_eq!(segment("v2 has 3.5 stars"), vec!["v2", "has", "3.5", "stars"]);
    }

    #[test]
    fn test_cjk_unigrams_and_bigrams() {
        assert_eq!(segment("杨梅?"), vec!["杨", "梅", "杨梅"]);
        assert_eq!(
            segment("杨梅酒"),
            vec!["杨", "梅", "酒", "杨梅", "梅酒"]
        );
    }

    #[test]
    fn test_mixed_scripts() {
        let terms = segment("Rust 语言，很快");
        assert_eq!(terms, vec!["rust", "语", "言", "语言", "很", "快", "很快"]);
    }

    #[test]
    fn test_blank_input() {
        assert!(segment("").is_empty());
        assert!(segment(" \n\t ... ").is_empty());
    }
}
