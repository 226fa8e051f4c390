//! Resource load-order planning.
//!
//! Swapping a multi-gigabyte checkpoint in and out of device memory costs
//! far more than rendering a cell, so a grid that alternates between models
//! should be reordered to render every cell of one model before moving to
//! the next. These functions are pure; the caller decides whether to apply
//! the suggested order.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::Serialize;

use crate::types::{BYTES_PER_GB, BYTES_PER_MB};

/// Assumed footprint of one primary model when planning.
pub const DEFAULT_MODEL_SIZE_BYTES: u64 = 2 * BYTES_PER_GB;

/// Assumed footprint of one VAE decoder when planning.
pub const DEFAULT_VAE_SIZE_BYTES: u64 = 500 * BYTES_PER_MB;

/// Assumed footprint of one LoRA adapter.
pub const DEFAULT_LORA_SIZE_BYTES: u64 = 200 * BYTES_PER_MB;

/// Free memory must exceed the estimated need by this ratio (numerator,
/// denominator), i.e. a 20% margin.
const FREE_MEMORY_MARGIN: (u128, u128) = (6, 5);

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Reorder `items` so that all items sharing a key are contiguous.
///
/// Groups appear in the order their key first occurs; items within a group
/// keep their relative order. The output is a permutation of the input.
pub fn cluster_by<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut group_of: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<Vec<T>> = Vec::new();

    for item in items {
        let next = groups.len();
        let idx = *group_of.entry(key(&item)).or_insert(next);
        if idx == next {
            groups.push(Vec::new());
        }
        groups[idx].push(item);
    }

    groups.into_iter().flatten().collect()
}

/// Cluster repeated identifiers together in first-occurrence order.
///
/// `[a, b, a, c, b, a]` becomes `[a, a, a, b, b, c]`.
pub fn plan_order<T>(ids: &[T]) -> Vec<T>
where
    T: Clone + Eq + Hash,
{
    cluster_by(ids.to_vec(), |id| id.clone())
}

/// Number of model switches needed to process `ids` in the given order.
///
/// The first load counts as a switch.
pub fn count_switches<T: PartialEq>(ids: &[T]) -> usize {
    let mut switches = 0;
    let mut current: Option<&T> = None;
    for id in ids {
        if current != Some(id) {
            switches += 1;
            current = Some(id);
        }
    }
    switches
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Per-class footprint assumptions used by [`suggest_strategy`].
#[derive(Debug, Clone, Copy)]
pub struct SizeEstimates {
    pub model_bytes: u64,
    pub vae_bytes: u64,
}

impl Default for SizeEstimates {
    fn default() -> Self {
        Self {
            model_bytes: DEFAULT_MODEL_SIZE_BYTES,
            vae_bytes: DEFAULT_VAE_SIZE_BYTES,
        }
    }
}

/// Caching recommendation for an upcoming grid batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachingStrategy {
    pub cache_all_models: bool,
    pub cache_all_vaes: bool,
    /// Model order the batch should load in.
    pub recommended_order: Vec<String>,
    pub memory_sufficient: bool,
    /// Estimated bytes to hold every distinct model and VAE at once.
    pub estimated_bytes: u64,
}

/// Decide whether every distinct model and VAE of a batch can stay
/// resident, given `free_bytes` of device memory.
///
/// When they fit (with a 20% margin) the batch keeps its original order and
/// caches everything. Otherwise nothing is cached up-front and the models
/// are clustered with [`plan_order`] to minimise swaps.
pub fn suggest_strategy<S: AsRef<str>>(
    model_ids: &[S],
    vae_ids: &[S],
    free_bytes: u64,
    estimates: SizeEstimates,
) -> CachingStrategy {
    let distinct_models: HashSet<&str> = model_ids.iter().map(AsRef::as_ref).collect();
    let distinct_vaes: HashSet<&str> = vae_ids.iter().map(AsRef::as_ref).collect();

    let estimated_bytes = (distinct_models.len() as u64)
        .saturating_mul(estimates.model_bytes)
        .saturating_add((distinct_vaes.len() as u64).saturating_mul(estimates.vae_bytes));

    let (num, den) = FREE_MEMORY_MARGIN;
    let memory_sufficient = u128::from(free_bytes) * den > u128::from(estimated_bytes) * num;

    let ids: Vec<String> = model_ids.iter().map(|s| s.as_ref().to_string()).collect();
    let recommended_order = if memory_sufficient {
        ids
    } else {
        plan_order(&ids)
    };

    CachingStrategy {
        cache_all_models: memory_sufficient,
        cache_all_vaes: memory_sufficient,
        recommended_order,
        memory_sufficient,
        estimated_bytes,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<&str>) -> Vec<&str> {
        v.sort_unstable();
        v
    }

    #[test]
    fn plan_order_groups_by_first_occurrence() {
        let input = ["a", "b", "a", "c", "b", "a"];
        assert_eq!(plan_order(&input), vec!["a", "a", "a", "b", "b", "c"]);
    }

    #[test]
    fn plan_order_single_identifier_unchanged() {
        assert_eq!(plan_order(&["x", "x", "x"]), vec!["x", "x", "x"]);
    }

    #[test]
    fn plan_order_empty_input() {
        let empty: [&str; 0] = [];
        assert!(plan_order(&empty).is_empty());
    }

    #[test]
    fn plan_order_preserves_multiset() {
        let input = vec!["m2", "m1", "m3", "m1", "m2", "m2", "m3", "m1"];
        let output = plan_order(&input);
        assert_eq!(output.len(), input.len());
        assert_eq!(sorted(output), sorted(input));
    }

    #[test]
    fn cluster_by_keeps_relative_order_within_group() {
        let cells = vec![(0, "a"), (1, "b"), (2, "a"), (3, "b"), (4, "c")];
        let out = cluster_by(cells, |(_, model)| *model);
        let indices: Vec<i32> = out.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 2, 1, 3, 4]);
    }

    #[test]
    fn clustering_reduces_switches() {
        let input = ["a", "b", "a", "c", "b", "a"];
        assert_eq!(count_switches(&input), 6);
        assert_eq!(count_switches(&plan_order(&input)), 3);
    }

    #[test]
    fn strategy_caches_everything_when_memory_allows() {
        let models = ["a", "b", "a"];
        let vaes = ["v"];
        // need = 2 models * 2 GiB + 1 VAE * 500 MiB
        let need = 2 * DEFAULT_MODEL_SIZE_BYTES + DEFAULT_VAE_SIZE_BYTES;
        let s = suggest_strategy(&models, &vaes, need * 2, SizeEstimates::default());
        assert!(s.memory_sufficient);
        assert!(s.cache_all_models);
        assert!(s.cache_all_vaes);
        assert_eq!(s.estimated_bytes, need);
        assert_eq!(s.recommended_order, vec!["a", "b", "a"]);
    }

    #[test]
    fn strategy_falls_back_to_planned_order() {
        let models = ["a", "b", "a"];
        let vaes: [&str; 0] = [];
        let need = 2 * DEFAULT_MODEL_SIZE_BYTES;
        // Enough to fit exactly, but not with the 20% margin.
        let s = suggest_strategy(&models, &vaes, need, SizeEstimates::default());
        assert!(!s.memory_sufficient);
        assert!(!s.cache_all_models);
        assert!(!s.cache_all_vaes);
        assert_eq!(s.recommended_order, vec!["a", "a", "b"]);
    }

    #[test]
    fn strategy_margin_boundary_is_exclusive() {
        let models = ["a"];
        let vaes: [&str; 0] = [];
        let est = SizeEstimates {
            model_bytes: 100,
            vae_bytes: 10,
        };
        assert!(!suggest_strategy(&models, &vaes, 120, est).memory_sufficient);
        assert!(suggest_strategy(&models, &vaes, 121, est).memory_sufficient);
    }
}
