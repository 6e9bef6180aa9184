//! Polynomial expansion of feature-interaction terms.
//!
//! A term is a string of namespace characters; `"ab"` crosses namespaces `a`
//! and `b`. Terms are kept canonical by sorting their characters.

use ot_types::canonical_term;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

/// Every term of order 2 through `order` reachable by repeatedly
/// concatenating a term of the previous level with a seed term.
///
/// Output order is deterministic: level by level, in the order terms are
/// first produced. Without `allow_self_inter`, repeated namespaces are
/// collapsed (`"aab"` becomes `"ab"`) and terms left with a single namespace
/// are dropped. Terms longer than `highest_poly_order` are filtered out.
pub fn generate_all_comb(
    seed: &[String],
    order: usize,
    allow_self_inter: bool,
    highest_poly_order: Option<usize>,
) -> Vec<String> {
    let mut level: Vec<String> = seed.to_vec();
    let mut all = Vec::new();
    for _ in 1..order {
        level = cross(&level, seed);
        all.extend(level.iter().cloned());
    }

    if !allow_self_inter {
        let mut stripped: Vec<String> = Vec::new();
        for term in &all {
            let term = strip_self_interactions(term);
            if term.chars().count() > 1 && !stripped.contains(&term) {
                stripped.push(term);
            }
        }
        all = stripped;
    }

    if let Some(max_len) = highest_poly_order {
        all.retain(|term| term.chars().count() <= max_len);
    }
    all
}

fn cross(left: &[String], right: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for a in left {
        for b in right {
            let term = canonical_term(&format!("{a}{b}"));
            if !out.contains(&term) {
                out.push(term);
            }
        }
    }
    out
}

/// Drop repeated namespaces, keeping first-seen order.
pub fn strip_self_interactions(term: &str) -> String {
    let mut seen = BTreeSet::new();
    term.chars().filter(|c| seen.insert(*c)).collect()
}

/// All `k`-element combinations of `items`, in lexicographic index order.
pub fn combinations<T: Clone>(items: &[T], k: usize) -> Vec<Vec<T>> {
    let n = items.len();
    if k == 0 || k > n {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        out.push(idx.iter().map(|&i| items[i].clone()).collect());
        // rightmost index that can still advance
        let Some(pos) = (0..k).rev().find(|&i| idx[i] != i + n - k) else {
            return out;
        };
        idx[pos] += 1;
        for j in pos + 1..k {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

/// Candidate interaction sets: the seed plus `addition_num` new terms each.
///
/// Combinations are sorted before the seeded shuffle, so the result depends
/// only on the inputs and the RNG state. Single-namespace terms are removed
/// from every candidate; linear features are always present in the learner.
pub fn expansion_candidates(
    seed: &BTreeSet<String>,
    all_comb: &[String],
    addition_num: usize,
    rng: &mut StdRng,
) -> Vec<BTreeSet<String>> {
    let mut space = combinations(all_comb, addition_num);
    space.sort();
    space.shuffle(rng);

    space
        .into_iter()
        .map(|added| {
            seed.iter()
                .cloned()
                .chain(added)
                .filter(|term| term.chars().count() > 1)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn terms(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pairwise_expansion_without_self_interactions() {
        let all = generate_all_comb(&terms(&["a", "b"]), 2, false, None);
        assert!(all.contains(&"ab".to_string()));
        assert!(!all.contains(&"aa".to_string()));
        assert!(!all.contains(&"bb".to_string()));
        assert_eq!(all, terms(&["ab"]));
    }

    #[test]
    fn self_interactions_kept_when_allowed() {
        let all = generate_all_comb(&terms(&["a", "b"]), 2, true, None);
        assert_eq!(all, terms(&["aa", "ab", "bb"]));
    }

    #[test]
    fn higher_orders_accumulate_levels() {
        let all = generate_all_comb(&terms(&["a", "b", "c"]), 3, false, None);
        for expected in ["ab", "ac", "bc", "abc"] {
            assert!(all.contains(&expected.to_string()), "missing {expected}");
        }
        let capped = generate_all_comb(&terms(&["a", "b", "c"]), 3, false, Some(2));
        assert!(capped.iter().all(|t| t.len() <= 2));
        assert!(!capped.contains(&"abc".to_string()));
    }

    #[test]
    fn order_one_generates_nothing() {
        assert!(generate_all_comb(&terms(&["a", "b"]), 1, false, None).is_empty());
    }

    #[test]
    fn strip_keeps_first_seen_order() {
        assert_eq!(strip_self_interactions("aabca"), "abc");
        assert_eq!(strip_self_interactions("bba"), "ba");
    }

    #[test]
    fn combinations_enumerate_lexicographically() {
        let combos = combinations(&[1, 2, 3, 4], 2);
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0], vec![1, 2]);
        assert_eq!(combos[5], vec![3, 4]);
        assert!(combinations(&[1, 2], 3).is_empty());
        assert!(combinations(&[1, 2], 0).is_empty());
    }

    #[test]
    fn candidates_extend_seed_and_drop_singletons() {
        let seed: BTreeSet<String> = ["a", "b", "c", "ab"].iter().map(|s| s.to_string()).collect();
        let all = generate_all_comb(&seed.iter().cloned().collect::<Vec<_>>(), 2, false, None);
        let mut rng = StdRng::seed_from_u64(7);
        let candidates = expansion_candidates(&seed, &all, 1, &mut rng);
        assert_eq!(candidates.len(), all.len());
        for candidate in &candidates {
            assert!(candidate.contains("ab"));
            assert!(candidate.iter().all(|t| t.len() > 1));
        }
    }

    #[test]
    fn candidates_are_deterministic_per_seed() {
        let seed: BTreeSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let all = generate_all_comb(&seed.iter().cloned().collect::<Vec<_>>(), 2, false, None);
        let run = |s| expansion_candidates(&seed, &all, 1, &mut StdRng::seed_from_u64(s));
        assert_eq!(run(11), run(11));
    }
}
