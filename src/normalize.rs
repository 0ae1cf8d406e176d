//! Canonical naming for storefront listings.
//!
//! Storefronts name the same pack differently; downstream charts group by the
//! canonical (brand, description, size) from the table below.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extract::text::normalize_name;
use crate::models::ProductObservation;

static SIZE_NOISE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\d x]").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub matched: usize,
    pub unmatched: usize,
}

/// Canonical copy of `obs`, or `None` when no rule applies.
pub fn normalize(obs: &ProductObservation) -> Option<ProductObservation> {
    let (description, size) = CANONICAL
        .iter()
        .find(|rule| rule_matches(rule, obs))
        .map(|&(_, d, s)| (d, s))
        .or_else(|| keyword_match(obs))?;

    let mut out = obs.clone();
    if !out.metadata.contains_key("original_description") {
        out.set_meta("original_description", obs.description.as_str());
    }
    if obs.size.as_deref() != Some(size) {
        out.set_meta(
            "original_size",
            obs.size.clone().map(Value::String).unwrap_or(Value::Null),
        );
    }
    out.description = description.to_string();
    out.size = Some(size.to_string());
    Some(out)
}

/// Normalize what matches; everything else passes through unchanged.
pub fn normalize_batch(batch: Vec<ProductObservation>) -> (Vec<ProductObservation>, NormalizeStats) {
    let mut stats = NormalizeStats::default();
    let out = batch
        .into_iter()
        .map(|obs| match normalize(&obs) {
            Some(canonical) => {
                stats.matched += 1;
                canonical
            }
            None => {
                stats.unmatched += 1;
                obs
            }
        })
        .collect();
    (out, stats)
}

fn same_brand(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Same brand, then: exact size, description containment, or size-token containment.
fn rule_matches(&(brand, description, size): &(&str, &str, &str), obs: &ProductObservation) -> bool {
    if !same_brand(brand, &obs.brand) {
        return false;
    }
    let obs_size = obs.size.as_deref().unwrap_or("").trim().to_lowercase();
    if !obs_size.is_empty() && size.to_lowercase() == obs_size {
        return true;
    }
    if normalize_name(&obs.description).contains(&normalize_name(description)) {
        return true;
    }
    let tokens = SIZE_NOISE_RE.replace_all(&obs_size, "");
    let rule_tokens = SIZE_NOISE_RE.replace_all(&size.to_lowercase(), "").into_owned();
    !tokens.is_empty() && tokens.contains(rule_tokens.as_str())
}

fn keyword_match(obs: &ProductObservation) -> Option<(&'static str, &'static str)> {
    let text = obs.description.to_lowercase();
    KEYWORD_RULES
        .iter()
        .find(|(brand, keywords, _, _)| {
            same_brand(brand, &obs.brand) && keywords.iter().all(|k| text.contains(k))
        })
        .map(|&(_, _, d, s)| (d, s))
}

// ── Canonical table ──

/// (brand, description, size); first match wins.
const CANONICAL: &[(&str, &str, &str)] = &[
    ("Beautex", "Bathroom Tissue Rolls", "20 x 220"),
    ("Cloversoft", "Plant-Based Unbleached Bamboo", "10 x 200"),
    ("FairPrice", "Onwards Toilet Rolls", "30 x 220"),
    ("FairPrice", "DeluxSoft Bathroom Tissue", "20 x 200"),
    ("FairPrice", "DeluxSoft Bathroom Tissue", "10 x 200"),
    ("FairPrice", "Silky Soft Bathroom", "24 x 200"),
    ("FairPrice", "Silky Soft Bathroom", "10 x 200"),
    ("FairPrice", "DeluxSoft Bathroom", "100 x 200"),
    ("FairPrice", "DeluxSoft Bathroom", "120 (CTN)"),
    ("FairPrice", "Silky Soft Bathroom", "100 x 200"),
    ("Kleenex", "Toilet Rolls - Ultra Soft", "20 x 200"),
    ("Kleenex", "Ultra Soft Cottony", "30 x 200"),
    ("Kleenex", "Ultra Soft & Thick", "20 x 180"),
    ("Kleenex", "Ultra Soft Aloe", "20 x 190"),
    ("Kleenex", "Toilet Rolls - Ultra Soft", "10 x 200"),
    ("Kleenex", "Ultra Soft Aloe", "22 x 190"),
    ("Kleenex", "Toilet Rolls (4ply) + Moist Wipes", "30 x 180"),
    ("Kleenex", "Supreme Soft", "16 x 190"),
    ("Kleenex", "Green Tea", "20 x 190"),
    ("Kleenex", "Ultra Soft Aloe", "10 x 190"),
    ("Neutra", "Bathroom Tissue Rolls", "20 x 190"),
    ("NooTrees", "Bamboo Toilet Tissue", "10 x 220"),
    ("Paseo", "Bathroom Roll", "10 x 200"),
    ("Paseo", "Bathroom Roll", "30 x 200"),
    ("Paseo", "Sensitive Skin", "10 x 200"),
    ("Paseo", "Sensitive Skin", "20 x 200"),
    ("Paseo", "Luxury Pure Pulp", "24 x 180"),
    ("Pursoft", "100% Virgin Pulp Unscented", "24 x 1"),
    ("Pursoft", "Lavender Vanilla", "24 x 180"),
    ("Pursoft", "Bathroom Toilet R - Unscented", "24 x 220"),
    ("Pursoft", "Green Tea", "24 x 180"),
    ("Pursoft", "Citrus Verbena", "24 x 180"),
    ("Pursoft", "Bathroom Toilet R - Unscented", "10 x 220"),
    ("Pursoft", "Bathroom Toilet R - Unscented", "10 x 200"),
    ("Pursoft", "Charcoal Floral", "10 x 220"),
    ("Pursoft", "Lavender Vanilla", "10 x 180"),
    ("Pursoft", "Citrus Verbena", "10 x 180"),
    ("Pursoft", "Green Tea", "10 x 180"),
    ("Pursoft", "Charcoal Floral", "24 x 220"),
    ("Tempo", "Bathroom Tissue - Neutral", "10 x 1"),
    ("Vinda", "Deluxe Smooth Feel Toilet T", "20 x 240"),
    ("Vinda", "Deluxe Smooth Feel Mega Val", "24 x 1"),
    ("Vinda", "Prestige Bathroom - 4D Emboss Camillia", "16 x 200"),
    ("Vinda", "Prestige Toilet Tissue", "8 x 200"),
    ("Vinda", "Prestige Bathroom - 4D Emboss Camillia", "8 x 200"),
];

/// (brand, keywords that must all appear, description, size)
const KEYWORD_RULES: &[(&str, &[&str], &str, &str)] = &[
    ("Pursoft", &["green", "tea"], "Green Tea", "24 x 180"),
    ("Pursoft", &["lavender", "vanilla"], "Lavender Vanilla", "24 x 180"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_observation;

    fn obs(brand: &str, description: &str, size: Option<&str>) -> ProductObservation {
        let mut o = sample_observation(description);
        o.brand = brand.into();
        o.size = size.map(str::to_string);
        o
    }

    #[test]
    fn exact_size_match() {
        let n = normalize(&obs("Kleenex", "Kleenex Cottony Rolls", Some("30 X 200"))).unwrap();
        assert_eq!(n.description, "Ultra Soft Cottony");
        assert_eq!(n.size.as_deref(), Some("30 x 200"));
        assert_eq!(n.metadata["original_description"], "Kleenex Cottony Rolls");
        assert_eq!(n.metadata["original_size"], "30 X 200");
    }

    #[test]
    fn description_match_is_case_and_punctuation_insensitive() {
        let n = normalize(&obs("vinda", "VINDA Prestige toilet-tissue 3ply", None)).unwrap();
        assert_eq!(n.description, "Prestige Toilet Tissue");
        assert_eq!(n.size.as_deref(), Some("8 x 200"));
        assert!(n.metadata["original_size"].is_null());
    }

    #[test]
    fn keyword_fallback() {
        let n = normalize(&obs("Pursoft", "PurSoft Vanilla and Lavender Scented", Some("12 rolls"))).unwrap();
        assert_eq!(n.description, "Lavender Vanilla");
        assert_eq!(n.size.as_deref(), Some("24 x 180"));
    }

    #[test]
    fn existing_original_description_is_kept() {
        let mut o = obs("Paseo", "Sensitive Skin", Some("20 x 200"));
        o.set_meta("original_description", "Paseo 3-Ply Sensitive Skin Toilet Roll 20s");
        let n = normalize(&o).unwrap();
        assert_eq!(
            n.metadata["original_description"],
            "Paseo 3-Ply Sensitive Skin Toilet Roll 20s"
        );
    }

    #[test]
    fn unmatched_pass_through_and_are_counted() {
        let batch = vec![
            obs("Tempo", "Tempo Neutral Bathroom Tissue", Some("10 x 160")),
            obs("Kleenex", "Supreme Soft", None),
            obs("Other", "Mystery Rolls", Some("10 x 200")),
        ];
        let (out, stats) = normalize_batch(batch.clone());
        assert_eq!(stats, NormalizeStats { matched: 2, unmatched: 1 });
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].size.as_deref(), Some("16 x 190"));
        assert_eq!(out[2], batch[2]);
    }
}
