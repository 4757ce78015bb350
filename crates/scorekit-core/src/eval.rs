//! Ranking quality of a scorer against held-out interactions.
//!
//! Both metrics score the full catalogue for every user that has at least one
//! held-out item, and report one value per such user in ascending user order.
//! Items the user interacted with in training are forced to the worst rank so
//! they cannot crowd out held-out items. Tied scores share their average rank.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::error::ScorerError;
use crate::scorer::Predict;

/// `(user_id, item_id)` interaction pairs.
pub type Interactions<'a> = &'a [(usize, usize)];

/// Mean reciprocal rank of each user's held-out items.
///
/// Items are ranked by descending score (rank 1 is the best), and the value
/// for a user is the mean of `1 / rank` over that user's `test` items.
pub fn mrr_score<P: Predict + ?Sized>(
    scorer: &P,
    test: Interactions<'_>,
    train: Option<Interactions<'_>>,
) -> Result<Vec<f32>, ScorerError> {
    let test_items = group_by_user(scorer, test)?;
    let train_items = match train {
        Some(train) => group_by_user(scorer, train)?,
        None => BTreeMap::new(),
    };

    let mut scores = vec![0.0f32; scorer.num_items()];
    let mut mrrs = Vec::with_capacity(test_items.len());
    for (&user_id, positives) in &test_items {
        scorer.predict_into(user_id, &mut scores)?;

        // Negate so the highest score takes rank 1
        for score in scores.iter_mut() {
            *score = -*score;
        }
        if let Some(seen) = train_items.get(&user_id) {
            for &item in seen {
                scores[item] = f32::MAX;
            }
        }

        let ranks = average_ranks(&scores);
        let total: f64 = positives.iter().map(|&item| 1.0 / ranks[item]).sum();
        mrrs.push((total / positives.len() as f64) as f32);
    }

    debug!("Computed MRR for {} users", mrrs.len());
    Ok(mrrs)
}

/// Area under the ROC curve separating each user's held-out items from the
/// rest of the catalogue.
///
/// Users whose held-out items cover the whole catalogue have no negatives and
/// are skipped.
pub fn auc_score<P: Predict + ?Sized>(
    scorer: &P,
    test: Interactions<'_>,
    train: Option<Interactions<'_>>,
) -> Result<Vec<f32>, ScorerError> {
    let test_items = group_by_user(scorer, test)?;
    let train_items = match train {
        Some(train) => group_by_user(scorer, train)?,
        None => BTreeMap::new(),
    };

    let num_items = scorer.num_items();
    let mut scores = vec![0.0f32; num_items];
    let mut aucs = Vec::with_capacity(test_items.len());
    for (&user_id, positives) in &test_items {
        let negatives = num_items - positives.len();
        if negatives == 0 {
            continue;
        }

        scorer.predict_into(user_id, &mut scores)?;
        if let Some(seen) = train_items.get(&user_id) {
            for &item in seen {
                scores[item] = f32::MIN;
            }
        }

        // Mann-Whitney U over ascending ranks
        let ranks = average_ranks(&scores);
        let n_pos = positives.len() as f64;
        let rank_sum: f64 = positives.iter().map(|&item| ranks[item]).sum();
        let auc = (rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * negatives as f64);
        aucs.push(auc as f32);
    }

    debug!("Computed AUC for {} users", aucs.len());
    Ok(aucs)
}

/// Sorted, de-duplicated items per user, validated against the scorer.
fn group_by_user<P: Predict + ?Sized>(
    scorer: &P,
    interactions: Interactions<'_>,
) -> Result<BTreeMap<usize, Vec<usize>>, ScorerError> {
    let num_users = scorer.num_users();
    let num_items = scorer.num_items();

    let mut by_user: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(user_id, item_id) in interactions {
        if user_id >= num_users {
            return Err(ScorerError::UnknownUser { user_id, num_users });
        }
        if item_id >= num_items {
            return Err(ScorerError::UnknownItem { item_id, num_items });
        }
        by_user.entry(user_id).or_default().push(item_id);
    }
    for items in by_user.values_mut() {
        items.sort_unstable();
        items.dedup();
    }
    Ok(by_user)
}

/// 1-based ascending ranks; equal values share the mean of their positions.
fn average_ranks(values: &[f32]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0f64; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len()
            && values[order[end]].total_cmp(&values[order[start]]) == Ordering::Equal
        {
            end += 1;
        }
        // Positions start..end hold ranks start+1..=end
        let rank = (start + 1 + end) as f64 / 2.0;
        for &index in &order[start..end] {
            ranks[index] = rank;
        }
        start = end;
    }
    ranks
}
