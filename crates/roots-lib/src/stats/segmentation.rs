//! Mean-shift change point search on squared-error cost

use crate::changepoint::Penalty;

/// Segment cost over `[a, b)` from prefix sums
struct SquaredErrorCost {
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    scale: f64,
}

impl SquaredErrorCost {
    fn new(series: &[f64], scale: f64) -> Self {
        let mut sum = Vec::with_capacity(series.len() + 1);
        let mut sum_sq = Vec::with_capacity(series.len() + 1);
        sum.push(0.0);
        sum_sq.push(0.0);
        for &x in series {
            sum.push(sum[sum.len() - 1] + x);
            sum_sq.push(sum_sq[sum_sq.len() - 1] + x * x);
        }
        Self { sum, sum_sq, scale }
    }

    fn cost(&self, a: usize, b: usize) -> f64 {
        let len = (b - a) as f64;
        let s = self.sum[b] - self.sum[a];
        let sq = self.sum_sq[b] - self.sum_sq[a];
        ((sq - s * s / len) / self.scale).max(0.0)
    }
}

/// Cost function and per-change-point penalty for a series, or `None` when the
/// series carries no variation to segment
fn cost_and_penalty(series: &[f64], penalty: Penalty) -> Option<(SquaredErrorCost, f64)> {
    match penalty {
        Penalty::Manual(beta) => Some((SquaredErrorCost::new(series, 1.0), beta)),
        Penalty::Mbic => {
            let variance = noise_variance(series)?;
            let beta = 3.0 * (series.len() as f64).ln();
            Some((SquaredErrorCost::new(series, variance), beta))
        }
    }
}

/// Noise variance estimated from first differences, robust to level shifts
fn noise_variance(series: &[f64]) -> Option<f64> {
    if series.len() < 2 {
        return None;
    }
    let diffs: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();

    let mut abs: Vec<f64> = diffs.iter().map(|d| d.abs()).collect();
    abs.sort_by(|a, b| a.total_cmp(b));
    let mid = abs.len() / 2;
    let median = if abs.len() % 2 == 0 {
        (abs[mid - 1] + abs[mid]) / 2.0
    } else {
        abs[mid]
    };
    let sigma = median / (0.6745 * std::f64::consts::SQRT_2);
    if sigma > 0.0 {
        return Some(sigma * sigma);
    }

    // Mostly flat series: fall back to the mean squared difference
    let msd = diffs.iter().map(|d| d * d).sum::<f64>() / diffs.len() as f64 / 2.0;
    (msd > 0.0).then_some(msd)
}

/// Penalized optimal partitioning with pruning; returns segment start positions after 0
pub fn pelt(series: &[f64], penalty: Penalty) -> Vec<usize> {
    let n = series.len();
    if n < 2 {
        return Vec::new();
    }
    let Some((cost, beta)) = cost_and_penalty(series, penalty) else {
        return Vec::new();
    };

    let mut best = vec![0.0; n + 1];
    let mut previous = vec![0usize; n + 1];
    best[0] = -beta;
    let mut candidates = vec![0usize];

    for t in 1..=n {
        let mut min = f64::INFINITY;
        let mut arg = 0;
        for &s in &candidates {
            let value = best[s] + cost.cost(s, t) + beta;
            if value < min {
                min = value;
                arg = s;
            }
        }
        best[t] = min;
        previous[t] = arg;
        candidates.retain(|&s| best[s] + cost.cost(s, t) <= min + 1e-9);
        candidates.push(t);
    }

    let mut change_points = Vec::new();
    let mut t = n;
    while t > 0 {
        let s = previous[t];
        if s > 0 {
            change_points.push(s);
        }
        t = s;
    }
    change_points.reverse();
    change_points
}

/// Greedy binary segmentation; returns sorted segment start positions after 0
pub fn binary_segmentation(series: &[f64], penalty: Penalty, max_change_points: usize) -> Vec<usize> {
    let n = series.len();
    if n < 2 {
        return Vec::new();
    }
    let Some((cost, beta)) = cost_and_penalty(series, penalty) else {
        return Vec::new();
    };

    let mut segments = vec![(0usize, n)];
    let mut change_points = Vec::new();
    while change_points.len() < max_change_points {
        let mut best: Option<(f64, usize, usize)> = None;
        for (idx, &(a, b)) in segments.iter().enumerate() {
            if b - a < 2 {
                continue;
            }
            let whole = cost.cost(a, b);
            for k in (a + 1)..b {
                let gain = whole - cost.cost(a, k) - cost.cost(k, b);
                if best.map_or(true, |(g, _, _)| gain > g) {
                    best = Some((gain, idx, k));
                }
            }
        }
        match best {
            Some((gain, idx, k)) if gain > beta => {
                let (a, b) = segments[idx];
                segments[idx] = (a, k);
                segments.insert(idx + 1, (k, b));
                change_points.push(k);
            }
            _ => break,
        }
    }
    change_points.sort_unstable();
    change_points
}
