//! In-process statistics session

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::spawn_blocking;

use super::regression::{self, ImportanceDecomposition};
use super::segmentation;
use super::StatsSession;
use crate::changepoint::ChangePointMethod;
use crate::error::StatsError;

/// Session that keeps its frame in memory and computes results on the blocking pool
///
/// The frame is shared with the blocking task only for the duration of a computation,
/// so appends after it completes do not copy it.
#[derive(Debug, Default)]
pub struct LocalSession {
    frame: Arc<Vec<Vec<f64>>>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatsSession for LocalSession {
    fn reset(&mut self) {
        Arc::make_mut(&mut self.frame).clear();
    }

    fn append_row(&mut self, row: &[f64]) -> Result<(), StatsError> {
        if let Some(first) = self.frame.first() {
            if first.len() != row.len() {
                return Err(StatsError::ColumnMismatch {
                    expected: first.len(),
                    actual: row.len(),
                });
            }
        }
        Arc::make_mut(&mut self.frame).push(row.to_vec());
        Ok(())
    }

    fn row_count(&self) -> usize {
        self.frame.len()
    }

    async fn relative_importance(&mut self) -> Result<ImportanceDecomposition, StatsError> {
        let frame = Arc::clone(&self.frame);
        spawn_blocking(move || regression::lmg(&frame))
            .await
            .map_err(|e| StatsError::SessionFailed(format!("regression task failed: {e}")))?
    }

    async fn change_points(
        &mut self,
        series: &[f64],
        method: ChangePointMethod,
    ) -> Result<Vec<usize>, StatsError> {
        if series.iter().any(|x| !x.is_finite()) {
            return Err(StatsError::Degenerate(
                "series contains non-finite values".to_string(),
            ));
        }
        let series = series.to_vec();
        spawn_blocking(move || match method {
            ChangePointMethod::Pelt { penalty } => segmentation::pelt(&series, penalty),
            ChangePointMethod::BinSeg {
                penalty,
                max_change_points,
            } => segmentation::binary_segmentation(&series, penalty, max_change_points),
        })
        .await
        .map_err(|e| StatsError::SessionFailed(format!("segmentation task failed: {e}")))
    }
}
