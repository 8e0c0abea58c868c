//! OCR text normalization and fuzzy matching.
//!
//! OCR output from the game window is noisy: look-alike glyphs, stray
//! punctuation, digits inside words. Everything that compares OCR text goes
//! through `normalize_ocr` first so matching rules stay small.

/// Strip punctuation, unify look-alike glyphs, lowercase, collapse spaces.
pub fn normalize_ocr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        let mapped = match ch {
            'Ⅰ' | 'Ｉ' | 'ｌ' | '|' | '!' => '1',
            '０' | 'Ｏ' => '0',
            '５' => '5',
            '８' => '8',
            _ => ch,
        };
        if mapped.is_alphanumeric() {
            for lower in mapped.to_lowercase() {
                out.push(lower);
            }
        } else {
            out.push(' ');
        }
    }
    collapse_spaces(&out)
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Domain-aware fixes for skill titles: digits misread inside words become
/// letters when flanked by alphabetic characters (Gr0undw0rk -> Groundwork).
pub fn fix_common_ocr_confusions(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = Vec::with_capacity(chars.len());
    for (i, &ch) in chars.iter().enumerate() {
        let prev_alpha = i > 0 && chars[i - 1].is_alphabetic();
        let next_alpha = i + 1 < chars.len() && chars[i + 1].is_alphabetic();
        let fixed = match ch {
            '0' if prev_alpha && next_alpha => 'o',
            '6' if prev_alpha && next_alpha => 'g',
            _ => ch,
        };
        out.push(fixed);
    }
    out.into_iter().collect()
}

pub fn tokenize_ocr(s: &str) -> Vec<String> {
    normalize_ocr(s)
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

/// Similarity in [0, 1] between two strings, case-insensitive.
///
/// Levenshtein-based ratio; cheap enough for the short labels we compare.
pub fn fuzzy_ratio(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dist = levenshtein(&a, &b);
    let max_len = a.len().max(b.len()) as f32;
    1.0 - (dist as f32 / max_len)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            curr[j + 1] = sub.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// True when `needle` is (approximately) contained in `haystack`.
///
/// Direct substring after normalization first, then per-token similarity so
/// cross-word artefacts don't produce matches.
pub fn fuzzy_contains(haystack: &str, needle: &str, threshold: f32) -> bool {
    fuzzy_contains_ratio(haystack, needle, threshold).0
}

pub fn fuzzy_contains_ratio(haystack: &str, needle: &str, threshold: f32) -> (bool, f32) {
    let hs = normalize_ocr(haystack);
    let nd = normalize_ocr(needle);
    if nd.is_empty() {
        return (false, 0.0);
    }
    if hs.contains(&nd) {
        return (true, 1.0);
    }
    let mut best = 0.0f32;
    for tok in hs.split_whitespace() {
        let r = fuzzy_ratio(tok, &nd);
        if r > best {
            best = r;
        }
        if r >= threshold {
            return (true, r);
        }
    }
    (false, best)
}

pub fn fuzzy_best_match<'a>(text: &str, targets: &'a [String]) -> (Option<&'a str>, f32) {
    let mut best: Option<&str> = None;
    let mut score = 0.0f32;
    for t in targets {
        let r = fuzzy_ratio(text, t);
        if r > score {
            best = Some(t.as_str());
            score = r;
        }
    }
    (best, score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_lowers() {
        assert_eq!(normalize_ocr("  Corner-Recovery ○!  "), "corner recovery 1");
        assert_eq!(normalize_ocr("Swinging  Maestro"), "swinging maestro");
    }

    #[test]
    fn ocr_confusion_fixes_digits_inside_words() {
        assert_eq!(fix_common_ocr_confusions("Gr0undw0rk"), "Groundwork");
        assert_eq!(fix_common_ocr_confusions("hit 60 times"), "hit 60 times");
    }

    #[test]
    fn fuzzy_ratio_rewards_close_strings() {
        assert!(fuzzy_ratio("concentration", "concentration") > 0.99);
        assert!(fuzzy_ratio("concentratlon", "concentration") > 0.85);
        assert!(fuzzy_ratio("focus", "concentration") < 0.4);
    }

    #[test]
    fn fuzzy_contains_uses_substring_then_tokens() {
        assert!(fuzzy_contains("win the maiden race", "maiden", 0.8));
        assert!(fuzzy_contains("progress towards g1", "g1", 0.7));
        assert!(!fuzzy_contains("rest and relax", "race", 0.9));
    }
}
