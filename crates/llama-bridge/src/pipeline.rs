//! Pure sampling stages.
//!
//! Every stage works on a dense vector indexed by token id, so the final
//! weighted draw can walk the distribution in index order. Stages run in
//! this order:
//!
//! 1. repetition penalty on raw logits
//! 2. temperature (0 ⇒ greedy argmax, nothing below runs)
//! 3. softmax with max subtraction; the temperature divides the already
//!    shifted logits, so a tiny temperature can only underflow
//! 4. top-p, then top-k, each followed by renormalization
//! 5. weighted draw

use std::collections::HashSet;

/// Divide positive and multiply negative logits of every token in
/// `history` by `penalty`. Ids outside `logits` are ignored.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[i32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<usize> = history
        .iter()
        .filter_map(|&t| usize::try_from(t).ok())
        .filter(|&t| t < logits.len())
        .collect();
    for id in seen {
        let logit = &mut logits[id];
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

/// Index of the largest logit; the first one wins ties. NaN never wins.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    best
}

/// Numerically stable softmax. NaN entries get probability 0.
///
/// Returns `None` when no entry is finite, i.e. there is no distribution.
pub fn softmax(logits: &[f32]) -> Option<Vec<f32>> {
    softmax_with_temperature(logits, 1.0)
}

/// Softmax of `logits / temperature`, computed as `exp((l - max) / t)`.
///
/// `+inf` logits are the only candidates when present and share the mass
/// equally. `temperature` must be positive.
pub fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Option<Vec<f32>> {
    if logits.iter().any(|&v| v == f32::INFINITY) {
        let mut probs: Vec<f32> = logits
            .iter()
            .map(|&v| if v == f32::INFINITY { 1.0 } else { 0.0 })
            .collect();
        renormalize(&mut probs);
        return Some(probs);
    }

    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }

    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&v| {
            if v.is_nan() {
                0.0
            } else {
                ((v - max) / temperature).exp()
            }
        })
        .collect();
    renormalize(&mut probs);
    Some(probs)
}

/// Scale `probs` to sum to 1. No-op when the sum is zero.
pub fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

/// Ids sorted by descending probability; equal probabilities keep id order.
fn descending_order(probs: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    order
}

/// Nucleus filter: keep the shortest descending prefix whose cumulative
/// probability reaches `p`, including the entry that crosses it.
///
/// Applied only when `0 < p < 1`.
pub fn top_p(probs: &mut [f32], p: f32) {
    if !(p > 0.0 && p < 1.0) {
        return;
    }
    let order = descending_order(probs);
    let mut cumulative = 0.0f32;
    let mut keep = order.len();
    for (rank, &id) in order.iter().enumerate() {
        cumulative += probs[id];
        if cumulative >= p {
            keep = rank + 1;
            break;
        }
    }
    for &id in &order[keep..] {
        probs[id] = 0.0;
    }
    renormalize(probs);
}

/// Keep the `k` most probable entries. Applied only when `0 < k < len`.
pub fn top_k(probs: &mut [f32], k: usize) {
    if k == 0 || k >= probs.len() {
        return;
    }
    let order = descending_order(probs);
    for &id in &order[k..] {
        probs[id] = 0.0;
    }
    renormalize(probs);
}

/// Walk the cumulative distribution in id order and return the first id
/// whose cumulative probability exceeds `r` (expected in `[0, 1)`).
///
/// If rounding leaves the walk short, falls back to the last id with
/// non-zero probability.
pub fn draw(probs: &[f32], r: f32) -> usize {
    let mut cumulative = 0.0f32;
    for (id, &p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative > r {
            return id;
        }
    }
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0)
}

/// The filtered distribution a non-greedy draw samples from.
///
/// `temperature` must be positive. `None` when no logit is finite.
pub fn distribution(logits: &[f32], temperature: f32, p: f32, k: usize) -> Option<Vec<f32>> {
    let mut probs = softmax_with_temperature(logits, temperature)?;
    top_p(&mut probs, p);
    top_k(&mut probs, k);
    Some(probs)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn sum(v: &[f32]) -> f32 {
        v.iter().sum()
    }

    fn non_zero(v: &[f32]) -> usize {
        v.iter().filter(|&&p| p > 0.0).count()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let cases: [&[f32]; 4] = [
            &[1.0, 2.0, 3.0],
            &[1000.0, 999.0, -1000.0],
            &[-50.0, -50.0],
            &[0.0; 259],
        ];
        for logits in cases {
            let probs = softmax(logits).unwrap();
            assert_abs_diff_eq!(sum(&probs), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_softmax_survives_large_logits() {
        let probs = softmax(&[10_000.0, 10_000.0]).unwrap();
        assert_abs_diff_eq!(probs[0], 0.5, epsilon = 1e-6);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_softmax_non_finite_input() {
        assert!(softmax(&[f32::NAN, f32::NEG_INFINITY]).is_none());

        let probs = softmax(&[f32::NAN, 1.0, f32::NEG_INFINITY]).unwrap();
        assert_eq!(probs, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_positive_infinity_takes_all_mass() {
        assert_eq!(softmax(&[f32::INFINITY, 5.0]).unwrap(), vec![1.0, 0.0]);

        let probs = softmax(&[f32::INFINITY, 1.0, f32::INFINITY]).unwrap();
        assert_eq!(probs, vec![0.5, 0.0, 0.5]);
    }

    #[test]
    fn test_tiny_temperature_still_picks_argmax() {
        let logits = [0.1, 5.0, 2.0];
        for t in [1e-3, 1e-20, 1e-38, 1e-40] {
            let probs = distribution(&logits, t, 1.0, 0).unwrap();
            assert_eq!(probs, vec![0.0, 1.0, 0.0], "temperature {t}");
            for r in [0.0, 0.5, 0.999] {
                assert_eq!(draw(&probs, r), 1);
            }
        }
    }

    #[test]
    fn test_argmax_first_index_wins_ties() {
        assert_eq!(argmax(&[0.1, 5.0, 2.0]), 1);
        assert_eq!(argmax(&[3.0, 3.0, 1.0]), 0);
        assert_eq!(argmax(&[f32::NAN, 1.0]), 1);
        assert_eq!(argmax(&[f32::NAN, f32::NAN]), 0);
    }

    #[test]
    fn test_lower_temperature_concentrates_mass_on_argmax() {
        let logits = [1.0, 3.0, 2.0, 0.5];
        let mut previous = 0.0;
        for t in [2.0, 1.0, 0.5, 0.1] {
            let probs = distribution(&logits, t, 1.0, 0).unwrap();
            assert!(probs[1] > previous, "mass on argmax must grow as t drops");
            previous = probs[1];
        }
        assert!(previous > 0.99);
    }

    #[test]
    fn test_top_k_keeps_exactly_k() {
        let mut probs = softmax(&[1.0, 4.0, 3.0, 2.0, 0.0]).unwrap();
        top_k(&mut probs, 2);
        assert_eq!(non_zero(&probs), 2);
        assert!(probs[1] > 0.0 && probs[2] > 0.0);
        assert_abs_diff_eq!(sum(&probs), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_top_k_ties_keep_lower_ids() {
        let mut probs = vec![0.25; 4];
        top_k(&mut probs, 2);
        assert_eq!(probs, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_top_k_out_of_range_is_noop() {
        let original = vec![0.5, 0.3, 0.2];
        for k in [0, 3, 10] {
            let mut probs = original.clone();
            top_k(&mut probs, k);
            assert_eq!(probs, original);
        }
    }

    #[test]
    fn test_top_p_keeps_smallest_prefix_reaching_threshold() {
        let mut probs = vec![0.1, 0.5, 0.3, 0.1];
        top_p(&mut probs, 0.8);
        // 0.5 + 0.3 reaches 0.8 inclusively.
        assert_eq!(non_zero(&probs), 2);
        assert_abs_diff_eq!(probs[1], 0.625, epsilon = 1e-6);
        assert_abs_diff_eq!(probs[2], 0.375, epsilon = 1e-6);

        let mut probs = vec![0.1, 0.5, 0.3, 0.1];
        top_p(&mut probs, 0.81);
        assert_eq!(non_zero(&probs), 3);
        assert!(probs[0] > 0.0, "tie at 0.1 keeps the lower id");
        assert_eq!(probs[3], 0.0);
    }

    #[test]
    fn test_top_p_disabled_outside_open_interval() {
        let original = vec![0.7, 0.2, 0.1];
        for p in [0.0, 1.0, 1.5, -0.1] {
            let mut probs = original.clone();
            top_p(&mut probs, p);
            assert_eq!(probs, original);
        }
    }

    #[test]
    fn test_top_p_then_top_k_order() {
        // top-p keeps {0, 1, 2}; top-k then narrows to the best two.
        let mut probs = vec![0.4, 0.3, 0.2, 0.1];
        top_p(&mut probs, 0.85);
        top_k(&mut probs, 2);
        assert_eq!(non_zero(&probs), 2);
        assert_abs_diff_eq!(probs[0], 4.0 / 7.0, epsilon = 1e-6);
    }

    #[test]
    fn test_draw_walks_cumulative_distribution() {
        let probs = [0.2, 0.0, 0.5, 0.3];
        assert_eq!(draw(&probs, 0.0), 0);
        assert_eq!(draw(&probs, 0.19), 0);
        assert_eq!(draw(&probs, 0.2), 2);
        assert_eq!(draw(&probs, 0.69), 2);
        assert_eq!(draw(&probs, 0.75), 3);
    }

    #[test]
    fn test_draw_falls_back_to_last_non_zero() {
        let probs = [0.3, 0.3, 0.0];
        assert_eq!(draw(&probs, 0.9999), 1);
    }

    #[test]
    fn test_repetition_penalty() {
        let mut logits = vec![2.0, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 1, 7, -3], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0]);

        let mut logits = vec![2.0, -2.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 1.0);
        assert_eq!(logits, vec![2.0, -2.0]);
    }
}
