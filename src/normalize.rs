//! Text and identity normalization for product descriptions.
//!
//! Everything in this module is pure: the resolver and the fuzzy matcher
//! both depend on `normalize` producing the exact same token string for the
//! same logical product regardless of phrasing, accents or unit spelling.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Portuguese unit spellings mapped to their canonical short codes.
const UNIT_SYNONYMS: &[(&str, &str)] = &[
    ("ml", "ml"),
    ("mls", "ml"),
    ("mililitro", "ml"),
    ("mililitros", "ml"),
    ("g", "g"),
    ("gr", "g"),
    ("grs", "g"),
    ("grama", "g"),
    ("gramas", "g"),
    ("kg", "kg"),
    ("kgs", "kg"),
    ("quilo", "kg"),
    ("quilos", "kg"),
    ("kilo", "kg"),
    ("kilos", "kg"),
    ("quilograma", "kg"),
    ("quilogramas", "kg"),
    ("l", "l"),
    ("lt", "l"),
    ("lts", "l"),
    ("litro", "l"),
    ("litros", "l"),
    ("un", "un"),
    ("und", "un"),
    ("unid", "un"),
    ("unids", "un"),
    ("unidade", "un"),
    ("unidades", "un"),
    ("pct", "pct"),
    ("pc", "pct"),
    ("pcte", "pct"),
    ("pacote", "pct"),
    ("pacotes", "pct"),
    ("cx", "cx"),
    ("caixa", "cx"),
    ("caixas", "cx"),
    ("fd", "fd"),
    ("fardo", "fd"),
    ("fardos", "fd"),
];

/// Units that may carry a numeric quantity ("500ml", "1.5l", "12x350ml").
const WEIGHT_UNITS: &[&str] = &["ml", "g", "kg", "l", "un"];

const STOP_WORDS: &[&str] = &[
    "de", "da", "do", "das", "dos", "com", "para", "em", "e", "o", "a", "os", "as", "no", "na",
    "nos", "nas", "ao", "aos",
];

/// Tokens that change product identity even when every other token matches.
/// A candidate carrying one of these on only one side is never equivalent.
const VARIANT_KEYWORDS: &[&str] = &[
    "zero",
    "diet",
    "light",
    "original",
    "tradicional",
    "integral",
    "desnatado",
    "semidesnatado",
    "organico",
    "vegano",
    "sem",
    "acucar",
    "lactose",
    "gluten",
];

fn strip_accents(input: &str) -> String {
    input
        .chars()
        .map(|ch| match ch {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

fn canonical_unit(token: &str) -> Option<&'static str> {
    UNIT_SYNONYMS
        .iter()
        .find(|(spelling, _)| *spelling == token)
        .map(|(_, code)| *code)
}

/// Splits free text into lowercase, accent-free tokens. `.` and `,` survive
/// inside tokens so decimal quantities ("1,5l") reach the weight parser.
fn tokenize(input: &str) -> Vec<String> {
    strip_accents(&input.to_lowercase())
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == ',' {
                ch
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .map(|tok| tok.trim_matches(['.', ',']).to_string())
        .filter(|tok| !tok.is_empty())
        .collect()
}

fn format_quantity(value: f64) -> String {
    // `{}` on f64 already drops trailing zeros: 1.50 -> "1.5", 1.0 -> "1".
    format!("{value}")
}

fn parse_simple_weight(token: &str) -> Option<String> {
    let digits_end = token
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(token.len());
    let (num, unit) = token.split_at(digits_end);
    if num.is_empty() || unit.is_empty() {
        return None;
    }
    let unit = canonical_unit(unit).filter(|u| WEIGHT_UNITS.contains(u))?;
    let value: f64 = num.replace(',', ".").parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Some(format!("{}{unit}", format_quantity(value)))
}

/// Canonicalizes a quantity token: `500ML` -> `500ml`, `1,50LT` -> `1.5l`,
/// `12X350ML` -> `12x350ml`. Returns `None` for non-quantity tokens.
pub fn parse_weight_token(token: &str) -> Option<String> {
    if let Some((count, rest)) = token.split_once('x') {
        if !count.is_empty() && count.chars().all(|c| c.is_ascii_digit()) {
            let count: u64 = count.parse().ok()?;
            if count > 0 {
                if let Some(single) = parse_simple_weight(rest) {
                    return Some(format!("{count}x{single}"));
                }
            }
        }
    }
    parse_simple_weight(token)
}

pub fn is_weight_token(token: &str) -> bool {
    parse_weight_token(token).is_some_and(|canonical| canonical == token)
}

pub fn is_variant_token(token: &str) -> bool {
    VARIANT_KEYWORDS.contains(&token)
}

/// Joins a bare quantity token with a following unit token ("350 ml").
fn merge_weight_pairs(tokens: Vec<String>) -> Vec<String> {
    let mut merged = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter().peekable();
    while let Some(tok) = iter.next() {
        let numeric = !tok.is_empty()
            && tok
                .chars()
                .all(|c| c.is_ascii_digit() || c == '.' || c == ',');
        if numeric {
            if let Some(next) = iter.peek() {
                if canonical_unit(next).is_some_and(|u| WEIGHT_UNITS.contains(&u)) {
                    let unit = iter.next().unwrap_or_default();
                    merged.push(format!("{tok}{unit}"));
                    continue;
                }
            }
        }
        merged.push(tok);
    }
    merged
}

/// Canonical, order-independent token string for a free-text description.
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(term: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for token in merge_weight_pairs(tokenize(term)) {
        if STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        if let Some(weight) = parse_weight_token(&token) {
            out.push(weight);
            continue;
        }
        if let Some(unit) = canonical_unit(&token) {
            out.push(unit.to_string());
            continue;
        }
        out.push(token);
    }
    out.sort();
    out.dedup();
    out.join(" ")
}

/// Weight/volume tokens present in a normalized term.
pub fn weight_tokens(normalized: &str) -> Vec<String> {
    normalized
        .split(' ')
        .filter(|tok| is_weight_token(tok))
        .map(|tok| tok.to_string())
        .collect()
}

/// Variant keywords present in a normalized term.
pub fn variant_tokens(normalized: &str) -> Vec<String> {
    normalized
        .split(' ')
        .filter(|tok| is_variant_token(tok))
        .map(|tok| tok.to_string())
        .collect()
}

pub fn content_hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Stable identity for "the same logical product" across phrasings.
///
/// A product code wins when present (`code:<digits>`); otherwise the key is
/// a hash of the normalized metadata (`meta:<hash>`). Optional fields hash
/// through their normalized form so field order and phrasing are irrelevant.
pub fn build_identity_key(
    term: &str,
    brand: Option<&str>,
    flavor: Option<&str>,
    weight: Option<&str>,
    product_code: Option<&str>,
) -> String {
    if let Some(code) = product_code {
        let digits: String = code.chars().filter(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            return format!("code:{digits}");
        }
    }
    let material = format!(
        "{}|{}|{}|{}",
        normalize(term),
        normalize(brand.unwrap_or_default()),
        normalize(flavor.unwrap_or_default()),
        normalize(weight.unwrap_or_default()),
    );
    format!("meta:{}", &content_hash(&material)[..16])
}

const MAX_CANDIDATES: usize = 12;

fn push_candidate(out: &mut Vec<String>, seen: &mut HashSet<String>, candidate: String) {
    if candidate.is_empty() || out.len() >= MAX_CANDIDATES {
        return;
    }
    if seen.insert(candidate.clone()) {
        out.push(candidate);
    }
}

/// Ordered (most to least specific) normalized variants of one query.
///
/// Widening only drops descriptive tokens: weight and variant tokens survive
/// every variant because they change product identity.
pub fn build_expanded_candidates(
    term: &str,
    brand: Option<&str>,
    flavor: Option<&str>,
    weight: Option<&str>,
) -> Vec<String> {
    let brand = brand.unwrap_or_default();
    let flavor = flavor.unwrap_or_default();
    let weight = weight.unwrap_or_default();

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    push_candidate(
        &mut out,
        &mut seen,
        normalize(&format!("{term} {brand} {flavor} {weight}")),
    );
    push_candidate(
        &mut out,
        &mut seen,
        normalize(&format!("{term} {brand} {weight}")),
    );
    push_candidate(
        &mut out,
        &mut seen,
        normalize(&format!("{term} {flavor} {weight}")),
    );
    push_candidate(&mut out, &mut seen, normalize(&format!("{term} {brand}")));
    push_candidate(&mut out, &mut seen, normalize(&format!("{term} {weight}")));
    push_candidate(&mut out, &mut seen, normalize(term));

    // Truncated windows over the droppable tokens of the bare term.
    let base = normalize(&format!("{term} {weight}"));
    let tokens: Vec<&str> = base.split(' ').filter(|t| !t.is_empty()).collect();
    let protected: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| is_weight_token(t) || is_variant_token(t))
        .collect();
    let droppable: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| !is_weight_token(t) && !is_variant_token(t))
        .collect();
    if droppable.len() > 2 {
        for window in (2..droppable.len()).rev() {
            let mut kept: Vec<&str> = droppable[..window].to_vec();
            kept.extend(protected.iter().copied());
            push_candidate(&mut out, &mut seen, normalize(&kept.join(" ")));
        }
    }
    out
}

/// URL/key-safe slug for asset naming.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in strip_accents(&name.to_lowercase()).chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Deterministic key for an internally produced asset:
/// `imagens/smart-<slug>-<hash8>-v<version>.<ext>`.
pub fn smart_asset_key(product_name: &str, identity_key: &str, version: u32, ext: &str) -> String {
    let slug = slugify(product_name);
    let hash = &content_hash(identity_key)[..8];
    format!("imagens/smart-{slug}-{hash}-v{version}.{ext}")
}

/// Deterministic key for an externally sourced image, derived only from the
/// source URL so concurrent fetches of the same candidate collide on one key.
pub fn source_derived_key(source_url: &str, ext: &str) -> String {
    format!("imagens/web-{}.{ext}", &content_hash(source_url)[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "Refrigerante Coca-Cola Zero 350ML",
            "Leite Integral Parmalat 1 Litro",
            "Açúcar Cristal União 5kg",
            "AGUA MINERAL S/ GAS 12X500ML",
            "",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn normalize_canonicalizes_units_and_order() {
        assert_eq!(
            normalize("Leite Parmalat 1 Litro"),
            normalize("1l leite parmalat")
        );
        assert_eq!(normalize("5 unidades"), "5un");
        assert_eq!(normalize("Caixa de leite"), "cx leite");
    }

    #[test]
    fn weight_tokens_renormalize_precision() {
        assert_eq!(parse_weight_token("1,50l").as_deref(), Some("1.5l"));
        assert_eq!(parse_weight_token("500ml").as_deref(), Some("500ml"));
        assert_eq!(parse_weight_token("12x350ml").as_deref(), Some("12x350ml"));
        assert_eq!(parse_weight_token("2.0kg").as_deref(), Some("2kg"));
        assert_eq!(parse_weight_token("coca"), None);
        assert_eq!(parse_weight_token("350"), None);
    }

    #[test]
    fn merged_quantity_pairs() {
        assert!(normalize("cerveja 350 ml").contains("350ml"));
    }

    #[test]
    fn identity_key_prefers_product_code() {
        let key = build_identity_key("qualquer", None, None, None, Some("789.100-42"));
        assert_eq!(key, "code:78910042");
    }

    #[test]
    fn identity_key_is_stable_across_phrasing() {
        let a = build_identity_key(
            "Leite Parmalat 1L",
            Some("Parmalat"),
            None,
            Some("1L"),
            None,
        );
        let b = build_identity_key(
            "leite PARMALAT 1 litro",
            Some("parmalat"),
            None,
            Some("1 litro"),
            None,
        );
        assert_eq!(a, b);
        assert!(a.starts_with("meta:"));
    }

    #[test]
    fn expanded_candidates_keep_weight_and_variant_tokens() {
        let candidates = build_expanded_candidates(
            "Refrigerante Guaraná Antarctica Zero Açúcar",
            Some("Antarctica"),
            None,
            Some("2L"),
        );
        assert!(!candidates.is_empty());
        assert!(candidates.len() <= 12);
        for candidate in &candidates {
            assert!(candidate.contains("zero"), "variant dropped in {candidate}");
            assert!(candidate.contains("2l"), "weight dropped in {candidate}");
        }
        // most specific variant first
        assert!(candidates[0].contains("antarctica"));
    }

    #[test]
    fn expanded_candidates_dedupe() {
        let candidates = build_expanded_candidates("leite", None, None, None);
        let unique: HashSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }

    #[test]
    fn asset_keys_are_deterministic() {
        let a = smart_asset_key("Leite Parmalat 1L", "meta:abcd", 2, "webp");
        let b = smart_asset_key("Leite Parmalat 1L", "meta:abcd", 2, "webp");
        assert_eq!(a, b);
        assert!(a.starts_with("imagens/smart-leite-parmalat-1l-"));
        assert!(a.ends_with("-v2.webp"));

        let first = source_derived_key("https://cdn.example.com/img/1.png", "png");
        let second = source_derived_key(&first, "png");
        let third = source_derived_key(&first, "png");
        assert_eq!(second, third);
        assert!(first.starts_with("imagens/web-"));
    }

    #[test]
    fn variant_and_weight_helpers() {
        let normalized = normalize("Coca-Cola Zero 350ml");
        assert_eq!(variant_tokens(&normalized), vec!["zero"]);
        assert_eq!(weight_tokens(&normalized), vec!["350ml"]);
    }
}
