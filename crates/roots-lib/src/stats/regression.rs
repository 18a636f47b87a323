//! Relative importance of regressors via the LMG decomposition
//!
//! The OLS R² of every predictor subset is derived from the frame's covariance matrix
//! by sweeping the subset's pivots. Each predictor's score is its Shapley value over
//! those R² values, so scores always sum to the full model's R².

use crate::error::StatsError;

/// Largest predictor count accepted (the decomposition visits every subset)
pub const MAX_PREDICTORS: usize = 16;

/// Pivots whose residual variance falls below this share of the original are aliased
const ALIASING_TOLERANCE: f64 = 1e-10;

/// Per-predictor scores plus the variance explained by the full model
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceDecomposition {
    /// One score per predictor, in column order
    pub scores: Vec<f64>,
    pub r_squared: f64,
}

/// Decompose R² of the last column regressed on all preceding columns
pub fn lmg(rows: &[Vec<f64>]) -> Result<ImportanceDecomposition, StatsError> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if width < 2 {
        return Err(StatsError::Degenerate(
            "frame needs at least one predictor and a response".to_string(),
        ));
    }
    let predictors = width - 1;
    if predictors > MAX_PREDICTORS {
        return Err(StatsError::TooManyPredictors {
            max: MAX_PREDICTORS,
            actual: predictors,
        });
    }
    if let Some(row) = rows.iter().find(|r| r.len() != width) {
        return Err(StatsError::ColumnMismatch {
            expected: width,
            actual: row.len(),
        });
    }
    let required = predictors + 2;
    if rows.len() < required {
        return Err(StatsError::InsufficientRows {
            rows: rows.len(),
            required,
        });
    }

    let cov = covariance(rows, width);
    let total = cov[predictors][predictors];
    let n = rows.len() as f64;
    let response_mean = rows.iter().map(|r| r[predictors]).sum::<f64>() / n;
    if !total.is_finite() || total <= 1e-12 * n * (1.0 + response_mean * response_mean) {
        return Err(StatsError::Degenerate(
            "response has no variance".to_string(),
        ));
    }

    let subsets = 1usize << predictors;
    let r2: Vec<f64> = (0..subsets)
        .map(|mask| subset_r_squared(&cov, predictors, mask, total))
        .collect();

    let weights = shapley_weights(predictors);
    let mut scores = vec![0.0; predictors];
    for (j, score) in scores.iter_mut().enumerate() {
        let bit = 1usize << j;
        for mask in (0..subsets).filter(|m| m & bit == 0) {
            let size = mask.count_ones() as usize;
            *score += weights[size] * (r2[mask | bit] - r2[mask]);
        }
    }

    Ok(ImportanceDecomposition {
        scores,
        r_squared: r2[subsets - 1],
    })
}

/// Centered cross-product matrix (covariance times n)
fn covariance(rows: &[Vec<f64>], width: usize) -> Vec<Vec<f64>> {
    let n = rows.len() as f64;
    let means: Vec<f64> = (0..width)
        .map(|c| rows.iter().map(|r| r[c]).sum::<f64>() / n)
        .collect();

    let mut cov = vec![vec![0.0; width]; width];
    for row in rows {
        for i in 0..width {
            let di = row[i] - means[i];
            for j in i..width {
                cov[i][j] += di * (row[j] - means[j]);
            }
        }
    }
    for i in 0..width {
        for j in 0..i {
            cov[i][j] = cov[j][i];
        }
    }
    cov
}

/// R² of the response regressed on the predictors selected by `mask`
fn subset_r_squared(cov: &[Vec<f64>], predictors: usize, mask: usize, total: f64) -> f64 {
    if mask == 0 {
        return 0.0;
    }
    let mut index: Vec<usize> = (0..predictors).filter(|i| mask & (1 << i) != 0).collect();
    let k = index.len();
    index.push(predictors);

    let mut a: Vec<Vec<f64>> = index
        .iter()
        .map(|&i| index.iter().map(|&j| cov[i][j]).collect())
        .collect();

    for t in 0..k {
        let pivot = a[t][t];
        let original = cov[index[t]][index[t]];
        if pivot <= ALIASING_TOLERANCE * original || pivot <= 0.0 {
            continue;
        }
        for i in (t + 1)..=k {
            let factor = a[i][t] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in (t + 1)..=k {
                a[i][j] -= factor * a[t][j];
            }
        }
    }

    (1.0 - a[k][k] / total).clamp(0.0, 1.0)
}

/// Weight of a subset of size `s` in a Shapley average over `p` players
fn shapley_weights(p: usize) -> Vec<f64> {
    let mut factorial = vec![1.0_f64; p + 1];
    for i in 1..=p {
        factorial[i] = factorial[i - 1] * i as f64;
    }
    (0..p)
        .map(|s| factorial[s] * factorial[p - s - 1] / factorial[p])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(columns: &[&[f64]]) -> Vec<Vec<f64>> {
        let n = columns[0].len();
        (0..n).map(|i| columns.iter().map(|c| c[i]).collect()).collect()
    }

    #[test]
    fn test_scores_sum_to_r_squared() {
        let x1 = [12.0, 15.0, 11.0, 30.0, 14.0, 13.0, 28.0, 12.0, 16.0, 31.0];
        let x2 = [3.0, 4.0, 3.0, 5.0, 9.0, 3.0, 4.0, 10.0, 3.0, 4.0];
        let y: Vec<f64> = x1
            .iter()
            .zip(x2.iter())
            .enumerate()
            .map(|(i, (a, b))| a + b + 2.0 + (i % 2) as f64)
            .collect();

        let result = lmg(&frame(&[&x1, &x2, &y])).unwrap();
        let sum: f64 = result.scores.iter().sum();
        assert!((sum - result.r_squared).abs() < 1e-9);
        assert!(result.r_squared > 0.9 && result.r_squared <= 1.0);
        assert!(result.scores[0] > result.scores[1]);
        assert!(result.scores.iter().all(|s| *s >= 0.0));
    }

    #[test]
    fn test_single_predictor_matches_correlation() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.0, 4.1, 5.9, 8.2, 9.8];
        let result = lmg(&frame(&[&x, &y])).unwrap();

        let mx = 3.0;
        let my = y.iter().sum::<f64>() / 5.0;
        let sxy: f64 = x.iter().zip(y.iter()).map(|(a, b)| (a - mx) * (b - my)).sum();
        let sxx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
        let syy: f64 = y.iter().map(|b| (b - my).powi(2)).sum();
        let expected = sxy * sxy / (sxx * syy);

        assert!((result.r_squared - expected).abs() < 1e-9);
        assert!((result.scores[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_constant_predictor_is_aliased() {
        let x1 = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x2 = [7.0; 6];
        let y = [1.5, 2.5, 3.0, 4.5, 5.0, 6.5];
        let result = lmg(&frame(&[&x1, &x2, &y])).unwrap();

        assert!(result.scores[1].abs() < 1e-9);
        assert!((result.scores[0] - result.r_squared).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_response() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [5.0; 4];
        assert!(matches!(
            lmg(&frame(&[&x, &y])),
            Err(StatsError::Degenerate(_))
        ));
    }

    #[test]
    fn test_insufficient_rows() {
        let x1 = [1.0, 2.0, 3.0];
        let x2 = [3.0, 1.0, 2.0];
        let y = [1.0, 2.0, 4.0];
        assert!(matches!(
            lmg(&frame(&[&x1, &x2, &y])),
            Err(StatsError::InsufficientRows { rows: 3, required: 4 })
        ));
    }

    #[test]
    fn test_too_many_predictors() {
        let rows = vec![vec![1.0; MAX_PREDICTORS + 2]; MAX_PREDICTORS + 4];
        assert!(matches!(
            lmg(&rows),
            Err(StatsError::TooManyPredictors { .. })
        ));
    }
}
