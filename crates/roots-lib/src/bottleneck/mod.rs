//! Bottleneck identification for performance anomalies
//!
//! The [`BottleneckFinderService`] subscribes to the anomaly bus and runs every
//! configured strategy for each performance anomaly. Strategies are selected with the
//! `bi.finders` property (detector properties first, then the global properties),
//! defaulting to `RelativeImportance`.

mod percentile;
mod relative_importance;

pub use percentile::PercentileFinder;
pub use relative_importance::RelativeImportanceFinder;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::anomaly::{Anomaly, AnomalySubscriber, AnomalyType};
use crate::changepoint::Segment;
use crate::config::{resolve_property, Properties, BI_FINDERS, BI_PELT_PENALTY, BI_PERCENTILE};
use crate::error::{Result, RootsError};
use crate::models::ApplicationRequest;
use crate::observability::AnomalyLog;
use crate::stats::StatsEngine;
use crate::store::DataStoreRegistry;

pub const DEFAULT_FINDERS: &str = "RelativeImportance";
pub const DEFAULT_PELT_PENALTY: f64 = 0.1;
pub const DEFAULT_PERCENTILE: f64 = 95.0;

/// Name of the synthetic entry holding the variance no call explains
pub const LOCAL: &str = "LOCAL";

/// Known bottleneck finding strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderKind {
    RelativeImportance,
    Percentile,
}

impl FinderKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "RelativeImportance" => Ok(FinderKind::RelativeImportance),
            "Percentile" => Ok(FinderKind::Percentile),
            other => Err(RootsError::config(format!(
                "unknown bottleneck finder: {other:?}"
            ))),
        }
    }
}

/// Parse a comma-separated finder list; names are trimmed and must all be known
pub fn parse_finder_list(list: &str) -> Result<Vec<FinderKind>> {
    list.split(',')
        .map(|name| FinderKind::from_name(name.trim()))
        .collect()
}

/// One call's score within a ranking; rank 1 is the largest score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCall {
    pub name: String,
    pub score: f64,
    pub ranking: usize,
}

/// Assign rankings by descending score, ties keeping input order
pub fn rank(entries: Vec<(String, f64)>) -> Vec<RankedCall> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| entries[b].1.total_cmp(&entries[a].1));

    let mut ranked: Vec<RankedCall> = entries
        .into_iter()
        .map(|(name, score)| RankedCall {
            name,
            score,
            ranking: 0,
        })
        .collect();
    for (position, index) in order.into_iter().enumerate() {
        ranked[index].ranking = position + 1;
    }
    ranked
}

/// A change in a metric's level between two adjacent segments
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelShift {
    pub timestamp: i64,
    pub before: f64,
    pub after: f64,
}

/// Segmented history of one call's metric from the anomaly start onwards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallTrend {
    pub call: String,
    pub ranking: usize,
    pub segments: Vec<Segment>,
    pub level_shifts: Vec<LevelShift>,
    /// Percentage change from the first to the last segment; `None` without a shift
    pub net_change: Option<f64>,
}

/// Findings for one call path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathReport {
    pub path: String,
    /// Latest bucket's ranking, in call order
    pub rankings: Vec<RankedCall>,
    pub variance_explained: Option<f64>,
    pub trends: Vec<CallTrend>,
    /// Full per-bucket history of each call's metric
    pub history: Vec<(String, Vec<f64>)>,
}

/// Start of the `period`-wide bucket holding `timestamp`, aligned to `start`
pub(crate) fn bucket_start(timestamp: i64, start: i64, period: i64) -> i64 {
    (timestamp - start) / period * period + start
}

pub(crate) fn group_by_path(
    requests: Vec<ApplicationRequest>,
) -> BTreeMap<String, Vec<ApplicationRequest>> {
    let mut grouped: BTreeMap<String, Vec<ApplicationRequest>> = BTreeMap::new();
    for request in requests {
        grouped
            .entry(request.path_as_string())
            .or_default()
            .push(request);
    }
    grouped
}

pub(crate) fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Log and collect the level shifts between consecutive segments
///
/// `timestamps[offset + i]` is the bucket of series index `i`.
pub(crate) fn describe_segments(
    log: &AnomalyLog,
    anomaly: &Anomaly,
    metric: &str,
    timestamps: &[i64],
    offset: usize,
    segments: &[Segment],
) -> (Vec<LevelShift>, Option<f64>) {
    if segments.len() <= 1 {
        log.info(
            anomaly,
            format!("No significant changes in {metric} to report"),
        );
        return (Vec::new(), None);
    }

    let shifts: Vec<LevelShift> = segments
        .windows(2)
        .map(|pair| LevelShift {
            timestamp: timestamps[offset + pair[1].start],
            before: pair[0].mean,
            after: pair[1].mean,
        })
        .collect();
    for shift in &shifts {
        log.info(
            anomaly,
            format!(
                "{} level shift at {}: {} --> {}",
                capitalize(metric),
                format_timestamp(shift.timestamp),
                shift.before,
                shift.after
            ),
        );
    }

    let first = &segments[0];
    let last = &segments[segments.len() - 1];
    let net = first.percentage_increase(last);
    log.info(
        anomaly,
        format!(
            "Net change in {metric}: {} --> {} [{}%]",
            first.mean, last.mean, net
        ),
    );
    (shifts, Some(net))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Closed set of bottleneck finding strategies
pub enum BottleneckFinder {
    RelativeImportance(RelativeImportanceFinder),
    Percentile(PercentileFinder),
}

impl BottleneckFinder {
    pub fn name(&self) -> &'static str {
        match self {
            BottleneckFinder::RelativeImportance(_) => "RelativeImportance",
            BottleneckFinder::Percentile(_) => "Percentile",
        }
    }

    pub async fn analyze(&self, anomaly: &Anomaly) -> Result<Vec<PathReport>> {
        match self {
            BottleneckFinder::RelativeImportance(f) => f.analyze(anomaly).await,
            BottleneckFinder::Percentile(f) => f.analyze(anomaly).await,
        }
    }
}

/// Runs the configured bottleneck finders for every performance anomaly
pub struct BottleneckFinderService {
    stores: Arc<DataStoreRegistry>,
    stats: Arc<StatsEngine>,
    properties: Properties,
    log: AnomalyLog,
}

impl BottleneckFinderService {
    /// Build the service, rejecting invalid global finder settings
    pub fn new(
        stores: Arc<DataStoreRegistry>,
        stats: Arc<StatsEngine>,
        properties: Properties,
    ) -> Result<Self> {
        if let Some(list) = properties.get(BI_FINDERS) {
            parse_finder_list(list)?;
        }
        properties.get_parsed::<f64>(BI_PELT_PENALTY)?;
        if let Some(p) = properties.get_parsed::<f64>(BI_PERCENTILE)? {
            PercentileFinder::check_percentile(p)?;
        }
        Ok(Self {
            stores,
            stats,
            properties,
            log: AnomalyLog::new("BottleneckFinderService"),
        })
    }

    /// Parse a numeric strategy parameter with detector-then-global precedence
    fn parameter(&self, anomaly: &Anomaly, key: &str, default: f64) -> Result<f64> {
        match resolve_property(&anomaly.detector.properties, &self.properties, key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<f64>().map_err(|_| {
                RootsError::config(format!("invalid value for property {key}: {raw:?}"))
            }),
        }
    }

    /// Instantiate every finder named for this anomaly; any unknown name fails the whole set
    pub fn finders_for(&self, anomaly: &Anomaly) -> Result<Vec<BottleneckFinder>> {
        let list = resolve_property(&anomaly.detector.properties, &self.properties, BI_FINDERS)
            .unwrap_or(DEFAULT_FINDERS);

        parse_finder_list(list)?
            .into_iter()
            .map(|kind| match kind {
                FinderKind::RelativeImportance => {
                    let penalty = self.parameter(anomaly, BI_PELT_PENALTY, DEFAULT_PELT_PENALTY)?;
                    Ok(BottleneckFinder::RelativeImportance(
                        RelativeImportanceFinder::new(
                            self.stores.clone(),
                            self.stats.clone(),
                            penalty,
                        ),
                    ))
                }
                FinderKind::Percentile => {
                    let percentile = self.parameter(anomaly, BI_PERCENTILE, DEFAULT_PERCENTILE)?;
                    Ok(BottleneckFinder::Percentile(PercentileFinder::new(
                        self.stores.clone(),
                        self.stats.clone(),
                        percentile,
                    )?))
                }
            })
            .collect()
    }
}

#[async_trait]
impl AnomalySubscriber for BottleneckFinderService {
    fn name(&self) -> &str {
        "bottleneck-finder"
    }

    async fn on_anomaly(&self, anomaly: Arc<Anomaly>) -> Result<()> {
        if anomaly.anomaly_type == AnomalyType::Workload {
            return Ok(());
        }

        let finders = self.finders_for(&anomaly)?;
        for finder in finders {
            info!(
                anomaly_id = %anomaly.id,
                finder = finder.name(),
                "Running bottleneck finder"
            );
            if let Err(e) = finder.analyze(&anomaly).await {
                self.log
                    .error(&anomaly, "Error during bottleneck identification", &e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::DetectorInfo;
    use crate::stats::StatsEngineConfig;

    fn service(properties: Properties) -> Result<BottleneckFinderService> {
        BottleneckFinderService::new(
            Arc::new(DataStoreRegistry::default()),
            Arc::new(StatsEngine::local(StatsEngineConfig::default())),
            properties,
        )
    }

    fn anomaly(properties: Properties) -> Anomaly {
        let detector = DetectorInfo {
            application: "app".to_string(),
            data_store: "default".to_string(),
            period_in_seconds: 60,
            history_length_in_seconds: 3600,
            properties,
        };
        Anomaly::new(&detector, 0, 1000, AnomalyType::Performance, "GET /x", "test")
    }

    #[test]
    fn test_rank_is_stable_descending() {
        let ranked = rank(vec![
            ("a".to_string(), 0.2),
            ("b".to_string(), 0.5),
            ("c".to_string(), 0.2),
            (LOCAL.to_string(), 0.1),
        ]);
        let rankings: Vec<usize> = ranked.iter().map(|r| r.ranking).collect();
        assert_eq!(rankings, vec![2, 1, 3, 4]);
    }

    #[test]
    fn test_bucket_start() {
        assert_eq!(bucket_start(1000, 1000, 60_000), 1000);
        assert_eq!(bucket_start(61_000, 1000, 60_000), 61_000);
        assert_eq!(bucket_start(60_999, 1000, 60_000), 1000);
    }

    #[test]
    fn test_parse_finder_list() {
        assert_eq!(
            parse_finder_list("RelativeImportance , Percentile").unwrap(),
            vec![FinderKind::RelativeImportance, FinderKind::Percentile]
        );
        assert!(parse_finder_list("RelativeImportance,Bogus").is_err());
        assert!(parse_finder_list("").is_err());
    }

    #[test]
    fn test_service_validates_global_properties() {
        assert!(service(Properties::new()).is_ok());
        assert!(matches!(
            service(Properties::new().with(BI_FINDERS, "Bogus")),
            Err(RootsError::Config(_))
        ));
        assert!(matches!(
            service(Properties::new().with(BI_PELT_PENALTY, "high")),
            Err(RootsError::Config(_))
        ));
        assert!(matches!(
            service(Properties::new().with(BI_PERCENTILE, "150")),
            Err(RootsError::Config(_))
        ));
    }

    #[test]
    fn test_finder_selection_precedence() {
        let svc = service(Properties::new().with(BI_FINDERS, "Percentile")).unwrap();

        let global = svc.finders_for(&anomaly(Properties::new())).unwrap();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].name(), "Percentile");

        let detector = svc
            .finders_for(&anomaly(
                Properties::new().with(BI_FINDERS, "RelativeImportance,Percentile"),
            ))
            .unwrap();
        let names: Vec<&str> = detector.iter().map(BottleneckFinder::name).collect();
        assert_eq!(names, vec!["RelativeImportance", "Percentile"]);

        let default = service(Properties::new()).unwrap();
        let finders = default.finders_for(&anomaly(Properties::new())).unwrap();
        assert_eq!(finders[0].name(), "RelativeImportance");
    }

    #[test]
    fn test_unknown_detector_finder_fails_dispatch() {
        let svc = service(Properties::new()).unwrap();
        let result = svc.finders_for(&anomaly(
            Properties::new().with(BI_FINDERS, "RelativeImportance,Nope"),
        ));
        assert!(matches!(result, Err(RootsError::Config(_))));

        let bad_penalty = svc.finders_for(&anomaly(
            Properties::new().with(BI_PELT_PENALTY, "x"),
        ));
        assert!(matches!(bad_penalty, Err(RootsError::Config(_))));
    }

    #[tokio::test]
    async fn test_workload_anomalies_are_ignored() {
        let svc = service(Properties::new()).unwrap();
        let mut workload = anomaly(Properties::new().with(BI_FINDERS, "Nope"));
        workload.anomaly_type = AnomalyType::Workload;
        assert!(svc.on_anomaly(Arc::new(workload)).await.is_ok());
    }
}
