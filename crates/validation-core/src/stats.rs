//! Statistical primitives shared by every tier: rates, entropy, percentiles,
//! agreement coefficients, and one-way variance decomposition.

use contracts::KappaWeighting;

/// `numerator / denominator`, undefined for an empty denominator.
pub fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator).
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let center = mean(values)?;
    let variance = values
        .iter()
        .map(|value| (value - center).powi(2))
        .sum::<f64>()
        / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Linear-interpolated percentile of an ascending slice, `q` in [0, 1].
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || !q.is_finite() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

pub fn sort_finite(values: &mut Vec<f64>) {
    values.retain(|value| value.is_finite());
    values.sort_by(f64::total_cmp);
}

/// Shannon entropy in bits of a frequency vector. Zero counts contribute nothing.
pub fn shannon_entropy_bits<I>(counts: I) -> f64
where
    I: IntoIterator<Item = usize>,
{
    let counts: Vec<usize> = counts.into_iter().filter(|count| *count > 0).collect();
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let entropy = counts
        .iter()
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum::<f64>();
    entropy.max(0.0)
}

/// Cohen's kappa over a square confusion matrix, unweighted when `weighting`
/// is `None`. Returns `None` when the expected disagreement is zero, which
/// happens only when all mass sits in a single diagonal cell.
pub fn cohen_kappa(confusion: &[Vec<u64>], weighting: Option<KappaWeighting>) -> Option<f64> {
    let k = confusion.len();
    if k < 2 || confusion.iter().any(|row| row.len() != k) {
        return None;
    }
    let total: u64 = confusion.iter().flatten().sum();
    if total == 0 {
        return None;
    }
    let total = total as f64;
    let row_sums: Vec<f64> = confusion
        .iter()
        .map(|row| row.iter().sum::<u64>() as f64)
        .collect();
    let col_sums: Vec<f64> = (0..k)
        .map(|j| confusion.iter().map(|row| row[j]).sum::<u64>() as f64)
        .collect();

    let span = (k - 1) as f64;
    let weight = |i: usize, j: usize| -> f64 {
        let distance = i.abs_diff(j) as f64;
        match weighting {
            None => {
                if i == j {
                    0.0
                } else {
                    1.0
                }
            }
            Some(KappaWeighting::Linear) => distance / span,
            Some(KappaWeighting::Quadratic) => (distance / span).powi(2),
        }
    };

    let mut observed = 0.0;
    let mut expected = 0.0;
    for i in 0..k {
        for j in 0..k {
            let w = weight(i, j);
            observed += w * confusion[i][j] as f64;
            expected += w * row_sums[i] * col_sums[j] / total;
        }
    }
    if expected <= f64::EPSILON {
        return None;
    }
    // Bounded to the conventional range; weighted forms can overshoot on tiny tables.
    Some((1.0 - observed / expected).clamp(-1.0, 1.0))
}

/// Sums of squares for a one-way layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OneWaySummary {
    pub groups: usize,
    pub observations: usize,
    pub ss_between: f64,
    pub ss_within: f64,
    /// Effective group size for unbalanced designs.
    pub k0: f64,
}

impl OneWaySummary {
    pub fn ss_total(&self) -> f64 {
        self.ss_between + self.ss_within
    }

    pub fn ms_between(&self) -> f64 {
        self.ss_between / (self.groups - 1) as f64
    }

    pub fn ms_within(&self) -> f64 {
        self.ss_within / (self.observations - self.groups) as f64
    }

    /// ICC(1): share of variance attributable to group membership, with the
    /// k0 correction for unequal group sizes.
    pub fn icc1(&self) -> Option<f64> {
        let msb = self.ms_between();
        let msw = self.ms_within();
        let denominator = msb + (self.k0 - 1.0) * msw;
        if denominator.abs() <= f64::EPSILON {
            return None;
        }
        Some(((msb - msw) / denominator).min(1.0))
    }

    pub fn eta_squared(&self) -> Option<f64> {
        let total = self.ss_total();
        if total <= f64::EPSILON {
            return None;
        }
        Some((self.ss_between / total).clamp(0.0, 1.0))
    }
}

/// Requires at least two non-empty groups and more observations than groups.
pub fn one_way(groups: &[Vec<f64>]) -> Option<OneWaySummary> {
    let groups: Vec<&Vec<f64>> = groups.iter().filter(|group| !group.is_empty()).collect();
    let g = groups.len();
    let n: usize = groups.iter().map(|group| group.len()).sum();
    if g < 2 || n <= g {
        return None;
    }
    let grand_mean = groups.iter().flat_map(|group| group.iter()).sum::<f64>() / n as f64;

    let mut ss_between = 0.0;
    let mut ss_within = 0.0;
    for group in &groups {
        let group_mean = group.iter().sum::<f64>() / group.len() as f64;
        ss_between += group.len() as f64 * (group_mean - grand_mean).powi(2);
        ss_within += group
            .iter()
            .map(|value| (value - group_mean).powi(2))
            .sum::<f64>();
    }

    let sum_sq_sizes: f64 = groups.iter().map(|group| (group.len() as f64).powi(2)).sum();
    let k0 = (n as f64 - sum_sq_sizes / n as f64) / (g - 1) as f64;

    Some(OneWaySummary {
        groups: g,
        observations: n,
        ss_between,
        ss_within,
        k0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn entropy_of_uniform_and_point_mass() {
        assert!(close(shannon_entropy_bits([5, 5, 5, 5]), 2.0));
        assert!(close(shannon_entropy_bits([100, 0, 0]), 0.0));
        assert!(close(shannon_entropy_bits(Vec::<usize>::new()), 0.0));
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 1.0), Some(4.0));
        assert!(close(percentile(&sorted, 0.5).expect("median"), 2.5));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn kappa_perfect_and_chance() {
        let perfect = vec![vec![5, 0], vec![0, 5]];
        assert!(close(cohen_kappa(&perfect, None).expect("kappa"), 1.0));

        let chance = vec![vec![5, 5], vec![5, 5]];
        assert!(close(cohen_kappa(&chance, None).expect("kappa"), 0.0));

        let inverted = vec![vec![0, 5], vec![5, 0]];
        assert!(close(cohen_kappa(&inverted, None).expect("kappa"), -1.0));
    }

    #[test]
    fn kappa_single_cell_is_undefined() {
        let single = vec![vec![10, 0, 0], vec![0, 0, 0], vec![0, 0, 0]];
        assert_eq!(cohen_kappa(&single, Some(KappaWeighting::Quadratic)), None);
        assert_eq!(cohen_kappa(&single, None), None);
    }

    #[test]
    fn kappa_single_row_spread_over_columns_is_zero() {
        let one_row = vec![vec![2, 2], vec![0, 0]];
        assert!(close(cohen_kappa(&one_row, None).expect("kappa"), 0.0));
        let off_diagonal = vec![vec![0, 4], vec![0, 0]];
        assert!(cohen_kappa(&off_diagonal, None).is_some());
    }

    #[test]
    fn weighted_kappa_penalizes_distant_disagreement_more() {
        // Same number of mismatches; one table misses by one step, the other by two.
        let near = vec![vec![4, 1, 0], vec![0, 4, 1], vec![0, 0, 5]];
        let far = vec![vec![4, 0, 1], vec![0, 5, 0], vec![1, 0, 4]];
        let near_k = cohen_kappa(&near, Some(KappaWeighting::Linear)).expect("near");
        let far_k = cohen_kappa(&far, Some(KappaWeighting::Linear)).expect("far");
        assert!(near_k > far_k);
    }

    #[test]
    fn one_way_separated_groups() {
        let groups = vec![vec![1.0, 1.0, 1.0], vec![3.0, 3.0, 3.0]];
        let summary = one_way(&groups).expect("summary");
        assert!(close(summary.eta_squared().expect("eta"), 1.0));
        assert!(close(summary.icc1().expect("icc"), 1.0));
    }

    #[test]
    fn one_way_without_between_variance() {
        let groups = vec![vec![1.0, 3.0], vec![1.0, 3.0]];
        let summary = one_way(&groups).expect("summary");
        assert!(close(summary.eta_squared().expect("eta"), 0.0));
        assert!(summary.icc1().expect("icc") < 0.0);
    }

    #[test]
    fn one_way_rejects_single_group() {
        assert!(one_way(&[vec![1.0, 2.0]]).is_none());
        assert!(one_way(&[vec![1.0], vec![2.0]]).is_none());
    }
}
