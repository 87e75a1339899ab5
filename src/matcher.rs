//! Fuzzy matching of normalized query variants against stored asset keys.
//!
//! A storage key like `imagens/smart-leite-parmalat-1l-ab12cd34-v2.webp`
//! carries generated noise (hash, version, prefix directories) around a
//! recoverable token set. The matcher denoises keys, scores token overlap
//! against each query variant and applies the identity guards: a variant
//! keyword or weight mismatch rejects a candidate no matter how high the
//! overlap score is.

use crate::normalize::{is_variant_token, is_weight_token, normalize};
use crate::storage::ObjectRecord;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Confidence floors, tunable as data rather than control flow.
#[derive(Debug, Clone, Copy)]
pub struct MatchThresholds {
    pub strict_small: f64,
    pub strict_large: f64,
    pub relaxed_mid: f64,
    pub relaxed_large: f64,
    /// Minimum query tokens before relaxed matching applies at all.
    pub relaxed_min_tokens: usize,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            strict_small: 1.0,
            strict_large: 0.85,
            relaxed_mid: 0.62,
            relaxed_large: 0.58,
            relaxed_min_tokens: 4,
        }
    }
}

impl MatchThresholds {
    fn strict_floor(&self, token_count: usize) -> f64 {
        if token_count <= 2 {
            self.strict_small
        } else if token_count == 3 {
            (self.strict_small + self.strict_large) / 2.0
        } else {
            self.strict_large
        }
    }

    fn relaxed_floor(&self, token_count: usize) -> Option<f64> {
        if token_count < self.relaxed_min_tokens {
            None
        } else if token_count <= self.relaxed_min_tokens + 1 {
            Some(self.relaxed_mid)
        } else {
            Some(self.relaxed_large)
        }
    }
}

struct MemoEntry {
    result: Option<String>,
    expires_at: Instant,
}

const MEMO_TTL: Duration = Duration::from_secs(20);
const MEMO_CAP: usize = 1024;

pub struct FuzzyKeyMatcher {
    thresholds: MatchThresholds,
    memo: Mutex<HashMap<String, MemoEntry>>,
}

impl Default for FuzzyKeyMatcher {
    fn default() -> Self {
        Self::new(MatchThresholds::default())
    }
}

impl FuzzyKeyMatcher {
    pub fn new(thresholds: MatchThresholds) -> Self {
        Self {
            thresholds,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Best reusable storage key for the given normalized query variants,
    /// or `None`. Hits and misses are both memoized briefly so hot queries
    /// do not rescan the full index.
    pub fn find_best_match(
        &self,
        candidates: &[String],
        index: &[ObjectRecord],
    ) -> Option<String> {
        let memo_key = format!("{}#{}", candidates.join("|"), index.len());
        if let Ok(guard) = self.memo.lock() {
            if let Some(entry) = guard.get(&memo_key) {
                if entry.expires_at > Instant::now() {
                    return entry.result.clone();
                }
            }
        }

        let result = self.scan(candidates, index);

        if let Ok(mut guard) = self.memo.lock() {
            if guard.len() >= MEMO_CAP {
                guard.clear();
            }
            guard.insert(
                memo_key,
                MemoEntry {
                    result: result.clone(),
                    expires_at: Instant::now() + MEMO_TTL,
                },
            );
        }
        result
    }

    fn scan(&self, candidates: &[String], index: &[ObjectRecord]) -> Option<String> {
        let keys: Vec<(String, HashSet<String>)> = index
            .iter()
            .map(|rec| (rec.key.clone(), key_token_set(&rec.key)))
            .filter(|(_, tokens)| !tokens.is_empty())
            .collect();

        let mut best_strict: Option<(f64, usize, String)> = None;
        let mut best_relaxed: Option<(f64, usize, String)> = None;

        for (variant_rank, variant) in candidates.iter().enumerate() {
            let query: HashSet<String> =
                variant.split(' ').map(|t| t.to_string()).filter(|t| !t.is_empty()).collect();
            if query.is_empty() {
                continue;
            }
            let strict_floor = self.thresholds.strict_floor(query.len());
            let relaxed_floor = self.thresholds.relaxed_floor(query.len());

            for (key, key_tokens) in &keys {
                if variant_guard_rejects(&query, key_tokens) {
                    continue;
                }
                if weight_guard_rejects(&query, key_tokens) {
                    continue;
                }
                let score = overlap_ratio(&query, key_tokens);
                if score >= strict_floor {
                    if better(&best_strict, score, variant_rank) {
                        best_strict = Some((score, variant_rank, key.clone()));
                    }
                } else if let Some(floor) = relaxed_floor {
                    if score >= floor && better(&best_relaxed, score, variant_rank) {
                        best_relaxed = Some((score, variant_rank, key.clone()));
                    }
                }
            }
        }

        best_strict
            .or(best_relaxed)
            .map(|(_, _, key)| key)
    }
}

fn better(current: &Option<(f64, usize, String)>, score: f64, rank: usize) -> bool {
    match current {
        None => true,
        // More specific variants win ties; otherwise highest score.
        Some((best_score, best_rank, _)) => {
            rank < *best_rank || (rank == *best_rank && score > *best_score)
        }
    }
}

fn overlap_ratio(query: &HashSet<String>, key: &HashSet<String>) -> f64 {
    let overlap = query.intersection(key).count();
    let denom = query.len().max(key.len());
    if denom == 0 {
        0.0
    } else {
        overlap as f64 / denom as f64
    }
}

/// Rejects when a variant keyword appears on exactly one side.
fn variant_guard_rejects(query: &HashSet<String>, key: &HashSet<String>) -> bool {
    let query_variants: HashSet<&String> =
        query.iter().filter(|t| is_variant_token(t)).collect();
    let key_variants: HashSet<&String> = key.iter().filter(|t| is_variant_token(t)).collect();
    query_variants != key_variants
}

/// Rejects when the query names a weight and the key lacks it or disagrees.
fn weight_guard_rejects(query: &HashSet<String>, key: &HashSet<String>) -> bool {
    let query_weights: HashSet<&String> = query.iter().filter(|t| is_weight_token(t)).collect();
    if query_weights.is_empty() {
        return false;
    }
    let key_weights: HashSet<&String> = key.iter().filter(|t| is_weight_token(t)).collect();
    query_weights != key_weights
}

/// Recovers an approximate normalized token set from a storage key by
/// stripping directories, extension and generated-filename noise.
pub fn key_token_set(key: &str) -> HashSet<String> {
    let file = key.rsplit('/').next().unwrap_or(key);
    let stem = file.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(file);
    let words: Vec<&str> = stem
        .split(['-', '_'])
        .filter(|tok| !tok.is_empty() && !is_noise_token(tok))
        .collect();
    normalize(&words.join(" "))
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn is_noise_token(token: &str) -> bool {
    if token == "smart" || token == "web" {
        return true;
    }
    // version suffixes: v2, v10
    if let Some(rest) = token.strip_prefix('v') {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            return true;
        }
    }
    // timestamp prefixes: long digit runs
    if token.len() >= 8 && token.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    // content hashes: hex runs of at least six characters
    if token.len() >= 6 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }
    false
}

/// Whether a key already went through the processing pipeline (and so can
/// be reused without another cutout pass).
pub fn is_processed_key(key: &str) -> bool {
    let file = key.rsplit('/').next().unwrap_or(key);
    file.starts_with("smart-") || file.starts_with("web-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::build_expanded_candidates;

    fn record(key: &str) -> ObjectRecord {
        ObjectRecord {
            key: key.to_string(),
            size: 1000,
            last_modified: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn denoises_generated_keys() {
        let tokens = key_token_set("imagens/smart-leite-parmalat-1l-ab12cd34-v2.webp");
        assert!(tokens.contains("leite"));
        assert!(tokens.contains("parmalat"));
        assert!(tokens.contains("1l"));
        assert!(!tokens.contains("smart"));
        assert!(!tokens.contains("ab12cd34"));
        assert!(!tokens.contains("v2"));
    }

    #[test]
    fn drops_timestamp_prefixes() {
        let tokens = key_token_set("imagens/1699999999999-arroz-tio-joao-5kg.png");
        assert!(tokens.contains("arroz"));
        assert!(!tokens.iter().any(|t| t.len() > 8 && t.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn matches_existing_asset() {
        let matcher = FuzzyKeyMatcher::default();
        let index = vec![
            record("imagens/leite-parmalat-1l-abcdef-v2.webp"),
            record("imagens/arroz-tio-joao-5kg-001122-v1.webp"),
        ];
        let candidates =
            build_expanded_candidates("Leite Parmalat 1L", Some("Parmalat"), None, Some("1L"));
        let hit = matcher.find_best_match(&candidates, &index);
        assert_eq!(hit.as_deref(), Some("imagens/leite-parmalat-1l-abcdef-v2.webp"));
    }

    #[test]
    fn weight_mismatch_never_matches() {
        let matcher = FuzzyKeyMatcher::default();
        // Identical tokens except the volume.
        let index = vec![record("imagens/refrigerante-x-1l-abcdef-v1.webp")];
        let candidates =
            build_expanded_candidates("Refrigerante X 350ML", None, None, Some("350ML"));
        assert_eq!(matcher.find_best_match(&candidates, &index), None);
    }

    #[test]
    fn query_weight_requires_candidate_weight() {
        let matcher = FuzzyKeyMatcher::default();
        let index = vec![record("imagens/refrigerante-x-abcdef-v1.webp")];
        let candidates =
            build_expanded_candidates("Refrigerante X 350ML", None, None, Some("350ML"));
        assert_eq!(matcher.find_best_match(&candidates, &index), None);
    }

    #[test]
    fn variant_keyword_on_one_side_never_matches() {
        let matcher = FuzzyKeyMatcher::default();
        let with_zero = build_expanded_candidates("Coca-Cola Zero 350ml", None, None, None);
        let plain_index = vec![record("imagens/coca-cola-350ml-aabb11-v1.webp")];
        assert_eq!(matcher.find_best_match(&with_zero, &plain_index), None);

        let plain = build_expanded_candidates("Coca-Cola 350ml", None, None, None);
        let zero_index = vec![record("imagens/coca-cola-zero-350ml-aabb11-v1.webp")];
        assert_eq!(matcher.find_best_match(&plain, &zero_index), None);
    }

    #[test]
    fn relaxed_band_requires_enough_tokens() {
        let matcher = FuzzyKeyMatcher::default();
        // Two-token query scoring 0.66 against a three-token key: below the
        // strict floor, and too short for the relaxed band.
        let index = vec![record("imagens/biscoito-recheado-morango-9f8e7d-v1.webp")];
        let candidates = vec!["biscoito morango".to_string()];
        assert_eq!(matcher.find_best_match(&candidates, &index), None);
    }

    #[test]
    fn memoizes_hits_and_misses() {
        let matcher = FuzzyKeyMatcher::default();
        let index = vec![record("imagens/leite-parmalat-1l-abcdef-v2.webp")];
        let candidates = vec![normalize("leite parmalat 1l")];
        let first = matcher.find_best_match(&candidates, &index);
        let second = matcher.find_best_match(&candidates, &index);
        assert_eq!(first, second);

        let miss = matcher.find_best_match(&[normalize("produto inexistente aqui 3kg")], &index);
        assert_eq!(miss, None);
        let miss_again =
            matcher.find_best_match(&[normalize("produto inexistente aqui 3kg")], &index);
        assert_eq!(miss_again, None);
    }

    #[test]
    fn processed_key_detection() {
        assert!(is_processed_key("imagens/smart-leite-1l-ab12cd34-v1.webp"));
        assert!(is_processed_key("imagens/web-0011223344556677.png"));
        assert!(!is_processed_key("uploads/foto-da-prateleira.jpg"));
        assert!(!is_processed_key("imagens/leite-parmalat-1l-abcdef-v2.webp"));
    }
}
