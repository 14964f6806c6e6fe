//! Fuzzy name matching between scraped menu items and database rows.
//!
//! Scores are tiered: exact normalized match, containment, small edit
//! distance, then word overlap. Assignment is greedy bipartite: not
//! optimal, but deterministic, and good enough at menu scale.

use bfw_core::{DbMenuItem, ScrapedMenuItem};
use serde::Serialize;
use strsim::levenshtein;

pub const CRATE_NAME: &str = "bfw-match";

/// How a score was derived. `None` means below every tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchKind {
    Exact,
    Containment,
    EditDistance,
    WordOverlap,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchScore {
    pub score: f64,
    pub kind: MatchKind,
}

impl MatchScore {
    fn none() -> Self {
        Self {
            score: 0.0,
            kind: MatchKind::None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatchConfig {
    pub threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

/// Lowercase and strip everything non-alphanumeric.
pub fn normalize(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn normalize_words(input: &str) -> Vec<String> {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

fn word_matches(word: &str, others: &[String]) -> bool {
    others
        .iter()
        .any(|o| o.starts_with(word) || word.starts_with(o.as_str()) || o.contains(word))
}

fn overlap_coverage(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let hits = a.iter().filter(|w| word_matches(w, b)).count();
    hits as f64 / a.len() as f64
}

/// Score two item names in `[0, 1]`.
///
/// Tiers, checked in order:
/// 1. equal after [`normalize`] → 1.0
/// 2. one normalized form contains the other → 0.8 + 0.15 × length ratio
/// 3. Levenshtein distance < 3 → 0.85 − 0.1 × distance
/// 4. word-overlap coverage, kept only when ≥ 0.5; otherwise 0.0
///
/// Names that normalize to nothing (all punctuation) score 0.0 even
/// against each other: a "match" between two garbage names would pair
/// unrelated rows.
pub fn fuzzy_score(a: &str, b: &str) -> MatchScore {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() || nb.is_empty() {
        return MatchScore::none();
    }
    if na == nb {
        return MatchScore {
            score: 1.0,
            kind: MatchKind::Exact,
        };
    }

    if na.contains(&nb) || nb.contains(&na) {
        let shorter = na.len().min(nb.len()) as f64;
        let longer = na.len().max(nb.len()) as f64;
        let score = (0.8 + 0.15 * (shorter / longer)).clamp(0.8, 0.95);
        return MatchScore {
            score,
            kind: MatchKind::Containment,
        };
    }

    let distance = levenshtein(&na, &nb);
    if distance < 3 {
        return MatchScore {
            score: 0.85 - 0.1 * distance as f64,
            kind: MatchKind::EditDistance,
        };
    }

    let wa = normalize_words(a);
    let wb = normalize_words(b);
    let coverage = overlap_coverage(&wa, &wb).max(overlap_coverage(&wb, &wa));
    if coverage >= 0.5 {
        return MatchScore {
            score: coverage,
            kind: MatchKind::WordOverlap,
        };
    }

    MatchScore::none()
}

/// One accepted pairing, by index into the input slices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchedPair {
    pub scraped_index: usize,
    pub db_index: usize,
    pub score: f64,
}

/// Outcome of one matching run. Unmatched items are reported, never
/// silently paired with a low-confidence candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchReport {
    pub pairs: Vec<MatchedPair>,
    pub unmatched_scraped: Vec<usize>,
    pub unmatched_db: Vec<usize>,
}

/// Greedy bipartite assignment: all pairwise scores at or above threshold,
/// highest first, each side used at most once. Ties break on index order
/// so runs are deterministic.
pub fn assign_greedy(
    scraped: &[ScrapedMenuItem],
    db: &[DbMenuItem],
    config: MatchConfig,
) -> MatchReport {
    let mut candidates = Vec::new();
    for (si, s) in scraped.iter().enumerate() {
        for (di, d) in db.iter().enumerate() {
            let scored = fuzzy_score(&s.name, &d.name);
            if scored.score >= config.threshold {
                candidates.push(MatchedPair {
                    scraped_index: si,
                    db_index: di,
                    score: scored.score,
                });
            }
        }
    }
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.scraped_index.cmp(&b.scraped_index))
            .then(a.db_index.cmp(&b.db_index))
    });

    let mut used_scraped = vec![false; scraped.len()];
    let mut used_db = vec![false; db.len()];
    let mut pairs = Vec::new();
    for candidate in candidates {
        if used_scraped[candidate.scraped_index] || used_db[candidate.db_index] {
            continue;
        }
        used_scraped[candidate.scraped_index] = true;
        used_db[candidate.db_index] = true;
        pairs.push(candidate);
    }

    MatchReport {
        pairs,
        unmatched_scraped: (0..scraped.len()).filter(|&i| !used_scraped[i]).collect(),
        unmatched_db: (0..db.len()).filter(|&i| !used_db[i]).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scraped(name: &str) -> ScrapedMenuItem {
        ScrapedMenuItem {
            name: name.to_string(),
            description: None,
            price_text: None,
            price_value: None,
            image_url: Some(format!("https://img.example/{name}.jpg")),
            category: None,
        }
    }

    fn db_item(name: &str) -> DbMenuItem {
        DbMenuItem {
            id: Uuid::new_v4(),
            category_id: Uuid::new_v4(),
            name: name.to_string(),
            price_text: None,
            sort_order: 0,
            image_url: None,
            cdn_image_url: None,
        }
    }

    #[test]
    fn normalized_equality_scores_exactly_one() {
        for (a, b) in [
            ("Chicken Rice", "chicken rice"),
            ("Mee-Goreng!", "mee goreng"),
            ("Curry Puff", "CURRY PUFF"),
        ] {
            let m = fuzzy_score(a, b);
            assert_eq!(m.score, 1.0, "{a} vs {b}");
            assert_eq!(m.kind, MatchKind::Exact);
        }
    }

    #[test]
    fn containment_with_size_variant_is_a_match() {
        let m = fuzzy_score("Chicken Rice (L)", "chicken rice");
        assert_eq!(m.kind, MatchKind::Containment);
        assert!(m.score >= 0.8 && m.score <= 0.95);
        assert!(m.score >= 0.5, "must clear the match threshold");
    }

    #[test]
    fn small_typo_scores_by_edit_distance() {
        let m = fuzzy_score("laksa", "lakse");
        assert_eq!(m.kind, MatchKind::EditDistance);
        assert!((m.score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn unrelated_names_score_zero() {
        // No containment, distance >= 3, coverage < 0.5.
        let m = fuzzy_score("Curry Puff", "Teh Tarik");
        assert_eq!(m.score, 0.0);
        assert_eq!(m.kind, MatchKind::None);
    }

    #[test]
    fn punctuation_only_names_never_match() {
        let m = fuzzy_score("!!!", "--");
        assert_eq!(m.score, 0.0);
        assert_eq!(m.kind, MatchKind::None);
        assert_eq!(fuzzy_score("", "chicken rice").score, 0.0);
    }

    #[test]
    fn word_overlap_requires_half_coverage() {
        let m = fuzzy_score("signature chicken rice set", "chicken rice");
        assert!(m.score >= 0.5);
        let miss = fuzzy_score("signature chicken rice set meal deluxe", "otah");
        assert_eq!(miss.score, 0.0);
    }

    #[test]
    fn greedy_assignment_uses_each_side_at_most_once() {
        let scraped_items = vec![
            scraped("Chicken Rice"),
            scraped("Chicken Rice (L)"),
            scraped("Teh Tarik"),
        ];
        let db_items = vec![db_item("chicken rice"), db_item("Kopi O")];
        let report = assign_greedy(&scraped_items, &db_items, MatchConfig::default());

        let mut seen_scraped = std::collections::HashSet::new();
        let mut seen_db = std::collections::HashSet::new();
        for pair in &report.pairs {
            assert!(seen_scraped.insert(pair.scraped_index));
            assert!(seen_db.insert(pair.db_index));
        }
        // The exact match wins over the containment match for the one db row.
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].scraped_index, 0);
        assert_eq!(report.pairs[0].db_index, 0);
        assert!(report.unmatched_scraped.contains(&1));
        assert!(report.unmatched_scraped.contains(&2));
        assert!(report.unmatched_db.contains(&1));
    }

    #[test]
    fn assignment_is_deterministic_on_score_ties() {
        let scraped_items = vec![scraped("kaya toast"), scraped("kaya toast")];
        let db_items = vec![db_item("Kaya Toast"), db_item("Kaya Toast")];
        let a = assign_greedy(&scraped_items, &db_items, MatchConfig::default());
        let b = assign_greedy(&scraped_items, &db_items, MatchConfig::default());
        assert_eq!(a, b);
        assert_eq!(a.pairs.len(), 2);
        assert_eq!(a.pairs[0].scraped_index, 0);
        assert_eq!(a.pairs[0].db_index, 0);
    }
}
