//! Shared prompt normalization, used by the Request Guard (dedup keys) and
//! the Response Cache (cache keys and similarity scoring).

/// `lowercase(text)` with everything that isn't a word character or
/// whitespace stripped, then runs of whitespace collapsed to a single
/// space and the result trimmed.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    let mut collapsed = String::with_capacity(stripped.len());
    let mut last_was_space = false;
    for ch in stripped.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            collapsed.push(ch);
            last_was_space = false;
        }
    }
    collapsed.trim().to_string()
}

/// Character bigrams of a string, used by the Dice coefficient similarity
/// scorer. Returns an empty vec for strings shorter than two characters.
fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() < 2 {
        return Vec::new();
    }
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Dice coefficient over character bigrams of the normalized strings:
/// `2 * |A ∩ B| / (|A| + |B|)`. Identical normalized strings score 1; both
/// empty score 1 only if lengths match (i.e. both are empty); otherwise
/// either-empty scores 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    if na == nb {
        return 1.0;
    }

    let bigrams_a = bigrams(&na);
    let bigrams_b = bigrams(&nb);

    if bigrams_a.is_empty() || bigrams_b.is_empty() {
        return if na.is_empty() && nb.is_empty() { 1.0 } else { 0.0 };
    }

    let mut counts_b: std::collections::HashMap<(char, char), usize> = std::collections::HashMap::new();
    for bg in &bigrams_b {
        *counts_b.entry(*bg).or_insert(0) += 1;
    }

    let mut intersection = 0usize;
    for bg in &bigrams_a {
        if let Some(count) = counts_b.get_mut(bg) {
            if *count > 0 {
                intersection += 1;
                *count -= 1;
            }
        }
    }

    (2.0 * intersection as f64) / (bigrams_a.len() + bigrams_b.len()) as f64
}

#[cfg(test)]
mod normalize_tests {
    use super::*;

    // UNIT UNDER TEST: normalize() and similarity()
    // BUSINESS RESPONSIBILITY: normalization must be insensitive to case,
    //   punctuation, and whitespace runs so semantically identical prompts
    //   hash to the same cache key; similarity must score identical
    //   normalized strings as 1 and disjoint strings near 0.
    // TEST COVERAGE:
    //   - case, punctuation, and whitespace collapse to the same key
    //   - similarity of identical normalized strings is exactly 1
    //   - similarity of completely disjoint strings is 0
    //   - similarity is symmetric

    #[test]
    fn normalize_collapses_case_punctuation_and_whitespace() {
        // Act
        let a = normalize("What is  the CAPITAL of France?");
        let b = normalize("what is the capital of france");

        // Assert
        assert_eq!(a, b);
    }

    #[test]
    fn identical_normalized_strings_have_similarity_one() {
        // Act / Assert
        assert!((similarity("Hello, world!", "hello world") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn completely_disjoint_strings_have_similarity_near_zero() {
        // Act
        let score = similarity("abcdef", "zyxwvu");

        // Assert
        assert!(score < 0.3);
    }

    #[test]
    fn similarity_is_symmetric() {
        // Act
        let ab = similarity("what is the capital of france", "what's the capital city of france");
        let ba = similarity("what's the capital city of france", "what is the capital of france");

        // Assert
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn both_empty_strings_have_similarity_one() {
        // Act / Assert
        assert!((similarity("", "") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn one_empty_string_has_similarity_zero() {
        // Act / Assert
        assert_eq!(similarity("", "something"), 0.0);
    }
}
