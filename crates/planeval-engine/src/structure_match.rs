//! Token-overlap matching of raw structure names against a protocol's
//! declared canonical structures.
//!
//! Alias tables catch the common spelling variants; this matcher is the
//! fallback for names that share tokens with a canonical structure without
//! being listed as an alias (`"Spinal Cord PRV"` vs `"SpinalCord_PRV"`).
//! It is a pure function of the raw name and the candidate list, so it can
//! be tested without the rest of the resolution pipeline.

use serde::{Deserialize, Serialize};

/// Result of a fuzzy structure match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureMatch {
    /// Canonical structure name exactly as declared by the protocol.
    pub canonical: String,
    /// Token-overlap confidence in (0, 1]. 1.0 means the token sets agree.
    pub confidence: f64,
}

/// Splits on non-alphanumeric boundaries and lowercases, dropping empties.
pub fn tokenize(raw: &str) -> Vec<String> {
    raw.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
        .collect()
}

fn overlap_score(raw_tokens: &[String], candidate_tokens: &[String]) -> f64 {
    if raw_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }
    let overlap = raw_tokens
        .iter()
        .filter(|token| candidate_tokens.contains(token))
        .count();
    overlap as f64 / raw_tokens.len().max(candidate_tokens.len()) as f64
}

/// Picks the candidate with the highest token-set overlap above
/// `min_overlap` (exclusive). Candidates are visited in declared protocol
/// order and only a strictly greater score replaces the current best, so
/// ties resolve to the earliest declared candidate.
pub fn best_token_match<'a, I>(raw: &str, candidates: I, min_overlap: f64) -> Option<StructureMatch>
where
    I: IntoIterator<Item = &'a str>,
{
    let raw_tokens = tokenize(raw);
    if raw_tokens.is_empty() {
        return None;
    }
    // Tokens are deduplicated so repeated words do not inflate the score.
    let raw_tokens = dedup_tokens(raw_tokens);

    let mut best: Option<StructureMatch> = None;
    for candidate in candidates {
        let candidate_tokens = dedup_tokens(tokenize(candidate));
        let score = overlap_score(&raw_tokens, &candidate_tokens);
        if score <= min_overlap {
            continue;
        }
        let is_better = match &best {
            Some(current) => score > current.confidence,
            None => true,
        };
        if is_better {
            best = Some(StructureMatch {
                canonical: candidate.to_string(),
                confidence: score,
            });
        }
    }
    best
}

fn dedup_tokens(mut tokens: Vec<String>) -> Vec<String> {
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}
