use std::collections::HashSet;

/// Token containment over normalized alphanumeric words: |A ∩ B| / min(|A|, |B|).
///
/// Containment is deliberate rather than Jaccard: bank counterparty strings
/// differ mostly by suffix tokens ("ACME SUPPLIES" vs "ACME SUPPLIES INC"),
/// which full-set similarity would penalize.
pub fn token_overlap(a: &str, b: &str) -> f32 {
    let ta = tokens(a);
    let tb = tokens(b);

    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let common = ta.intersection(&tb).count();
    common as f32 / ta.len().min(tb.len()) as f32
}

fn tokens(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_are_one() {
        assert_eq!(token_overlap("ACME SUPPLIES", "acme supplies"), 1.0);
    }

    #[test]
    fn suffix_tokens_do_not_penalize() {
        assert_eq!(token_overlap("ACME SUPPLIES", "ACME SUPPLIES INC"), 1.0);
    }

    #[test]
    fn disjoint_strings_are_zero() {
        assert_eq!(token_overlap("STARBUCKS", "WHOLE FOODS"), 0.0);
    }

    #[test]
    fn partial_overlap() {
        let s = token_overlap("ACME SUPPLY CO", "ACME SUPPLIES");
        assert!(s > 0.0 && s < 1.0, "score {s}");
    }

    #[test]
    fn punctuation_and_case_normalized() {
        assert_eq!(token_overlap("AMZN*PRIME-VIDEO", "amzn prime video"), 1.0);
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(token_overlap("", "ACME"), 0.0);
        assert_eq!(token_overlap("", ""), 0.0);
    }
}
