//! Change point detection over numeric series
//!
//! Detectors split a series into contiguous [`Segment`]s of constant mean. The numeric
//! search itself runs inside a statistics session; this module turns the change point
//! positions it returns into segments.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RootsError};
use crate::stats::StatsSession;

/// Upper bound on change points found by binary segmentation
pub const DEFAULT_MAX_CHANGE_POINTS: usize = 5;

/// One contiguous run `start..end` of a series with its mean value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: usize,
    /// Exclusive upper bound
    pub end: usize,
    pub mean: f64,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Percentage change from this segment's mean to `other`'s mean
    ///
    /// Follows IEEE float semantics when this mean is zero (infinite or NaN).
    pub fn percentage_increase(&self, other: &Segment) -> f64 {
        (other.mean - self.mean) / self.mean * 100.0
    }
}

/// Penalty applied per change point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Penalty {
    /// Fixed penalty on the raw squared-error cost
    Manual(f64),
    /// Modified BIC, `3 ln n` on variance-normalized cost
    Mbic,
}

/// Search strategy executed by a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangePointMethod {
    Pelt { penalty: Penalty },
    BinSeg { penalty: Penalty, max_change_points: usize },
}

/// Pruned exact linear time search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeltDetector {
    penalty: Penalty,
}

impl PeltDetector {
    pub fn new(penalty: Penalty) -> Self {
        Self { penalty }
    }

    pub fn with_manual_penalty(penalty: f64) -> Self {
        Self::new(Penalty::Manual(penalty))
    }
}

impl Default for PeltDetector {
    fn default() -> Self {
        Self::new(Penalty::Mbic)
    }
}

/// Greedy binary segmentation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinSegDetector {
    penalty: Penalty,
    max_change_points: usize,
}

impl BinSegDetector {
    pub fn new(penalty: Penalty, max_change_points: usize) -> Self {
        Self {
            penalty,
            max_change_points,
        }
    }
}

impl Default for BinSegDetector {
    fn default() -> Self {
        Self::new(Penalty::Mbic, DEFAULT_MAX_CHANGE_POINTS)
    }
}

/// Closed set of change point detectors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangePointDetector {
    Pelt(PeltDetector),
    BinSeg(BinSegDetector),
}

impl ChangePointDetector {
    /// Build a detector from its configured name (`PELT` or `BinSeg`)
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim() {
            "PELT" => Ok(ChangePointDetector::Pelt(PeltDetector::default())),
            "BinSeg" => Ok(ChangePointDetector::BinSeg(BinSegDetector::default())),
            other => Err(RootsError::config(format!(
                "unknown change point detector: {other}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChangePointDetector::Pelt(_) => "PELT",
            ChangePointDetector::BinSeg(_) => "BinSeg",
        }
    }

    fn method(&self) -> ChangePointMethod {
        match self {
            ChangePointDetector::Pelt(d) => ChangePointMethod::Pelt { penalty: d.penalty },
            ChangePointDetector::BinSeg(d) => ChangePointMethod::BinSeg {
                penalty: d.penalty,
                max_change_points: d.max_change_points,
            },
        }
    }

    /// Split `series` into segments covering `0..series.len()`
    pub async fn compute_segments(
        &self,
        session: &mut dyn StatsSession,
        series: &[f64],
    ) -> Result<Vec<Segment>> {
        if series.len() < 2 {
            return Ok(vec![segment_of(series, 0, series.len())]);
        }
        let change_points = session.change_points(series, self.method()).await?;
        Ok(segments_from_change_points(series, &change_points))
    }
}

impl From<PeltDetector> for ChangePointDetector {
    fn from(d: PeltDetector) -> Self {
        ChangePointDetector::Pelt(d)
    }
}

impl From<BinSegDetector> for ChangePointDetector {
    fn from(d: BinSegDetector) -> Self {
        ChangePointDetector::BinSeg(d)
    }
}

fn segment_of(series: &[f64], start: usize, end: usize) -> Segment {
    let mean = if end > start {
        series[start..end].iter().sum::<f64>() / (end - start) as f64
    } else {
        0.0
    };
    Segment { start, end, mean }
}

/// Build segments from change point positions (start indices of every segment but the first)
///
/// Positions outside `1..len`, duplicates and unsorted input are tolerated.
pub fn segments_from_change_points(series: &[f64], change_points: &[usize]) -> Vec<Segment> {
    let n = series.len();
    let mut bounds: Vec<usize> = change_points
        .iter()
        .copied()
        .filter(|&cp| cp > 0 && cp < n)
        .collect();
    bounds.sort_unstable();
    bounds.dedup();

    let mut segments = Vec::with_capacity(bounds.len() + 1);
    let mut start = 0;
    for cp in bounds.into_iter().chain(std::iter::once(n)) {
        segments.push(segment_of(series, start, cp));
        start = cp;
    }
    segments
}
