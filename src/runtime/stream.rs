/// Single-pass record streams and the stage boundary
///
/// A `RecordStream` is a forward-only, pull-based iterator. Once consumed it cannot
/// be rewound; a fresh pass requires invoking the producing stage again. Nothing runs
/// ahead of what the consumer pulls, so backpressure is implicit.
use crate::error::PipelineError;
use crate::runtime::payload::{Crs, PayloadItem, PayloadKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type RecordStream = Box<dyn Iterator<Item = anyhow::Result<PayloadItem>> + Send>;

/// Box any iterator of results as a stream
pub fn stream<I>(iter: I) -> RecordStream
where
    I: Iterator<Item = anyhow::Result<PayloadItem>> + Send + 'static,
{
    Box::new(iter)
}

/// Stream over already materialized items
pub fn from_items<I>(items: I) -> RecordStream
where
    I: IntoIterator<Item = PayloadItem>,
    I::IntoIter: Send + 'static,
{
    Box::new(items.into_iter().map(Ok))
}

pub fn empty() -> RecordStream {
    Box::new(std::iter::empty())
}

/// Streams one after another, in the given order
pub fn concat(inputs: Vec<RecordStream>) -> RecordStream {
    Box::new(inputs.into_iter().flatten())
}

/// Items pulled through each stage boundary during one run
#[derive(Debug, Clone, Default)]
pub struct StageCounters {
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl StageCounters {
    pub fn record(&self, stage_id: &str) {
        *self.counts.lock().entry(stage_id.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, stage_id: &str) -> u64 {
        self.counts.lock().get(stage_id).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts.lock().clone()
    }
}

/// Wraps the output of one stage.
///
/// - failures are attributed to the stage (the first failing stage wins)
/// - all items share the first item's kind and CRS
/// - cancellation is checked before every pull
/// - after the first error the stream is fused
pub struct StageBoundary {
    stage_id: String,
    inner: RecordStream,
    cancel: CancellationToken,
    counters: StageCounters,
    shape: Option<(PayloadKind, Option<Crs>)>,
    done: bool,
}

impl StageBoundary {
    pub fn new(stage_id: impl Into<String>, inner: RecordStream, cancel: CancellationToken, counters: StageCounters) -> Self {
        Self {
            stage_id: stage_id.into(),
            inner,
            cancel,
            counters,
            shape: None,
            done: false,
        }
    }

    fn check_shape(&mut self, item: &PayloadItem) -> Result<(), PipelineError> {
        let kind = item.kind();
        let crs = item.crs().cloned();
        match &self.shape {
            None => {
                self.shape = Some((kind, crs));
                Ok(())
            }
            Some((first_kind, _)) if *first_kind != kind => Err(self.mixed(format!(
                "stage emitted a {} item after {} items",
                kind, first_kind
            ))),
            Some((_, first_crs)) if *first_crs != crs => Err(self.mixed(format!(
                "stage emitted CRS {} after {}",
                display_crs(&crs),
                display_crs(first_crs)
            ))),
            Some(_) => Ok(()),
        }
    }

    fn mixed(&self, message: String) -> PipelineError {
        PipelineError::StageExecution {
            stage_id: self.stage_id.clone(),
            source: anyhow::anyhow!(message),
        }
    }
}

fn display_crs(crs: &Option<Crs>) -> String {
    crs.as_ref().map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

impl Iterator for StageBoundary {
    type Item = anyhow::Result<PayloadItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(PipelineError::Cancelled.into()));
        }

        match self.inner.next()? {
            Ok(item) => match self.check_shape(&item) {
                Ok(()) => {
                    self.counters.record(&self.stage_id);
                    Some(Ok(item))
                }
                Err(e) => {
                    self.done = true;
                    Some(Err(e.into()))
                }
            },
            Err(e) => {
                self.done = true;
                Some(Err(PipelineError::from_stage(&self.stage_id, e).into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::payload::{TableRow, VectorRecord};
    use serde_json::{json, Map};

    fn point(crs: &str) -> PayloadItem {
        PayloadItem::Vector(VectorRecord::new(
            json!({"type": "Point", "coordinates": [0.0, 0.0]}),
            Map::new(),
            Crs::parse(crs),
        ))
    }

    fn boundary(items: Vec<anyhow::Result<PayloadItem>>) -> (StageBoundary, StageCounters, CancellationToken) {
        let counters = StageCounters::default();
        let cancel = CancellationToken::new();
        let boundary = StageBoundary::new("s1", stream(items.into_iter()), cancel.clone(), counters.clone());
        (boundary, counters, cancel)
    }

    #[test]
    fn counts_items_and_passes_them_through() {
        let (boundary, counters, _) = boundary(vec![Ok(point("EPSG:4326")), Ok(point("EPSG:4326"))]);
        assert_eq!(boundary.filter(Result::is_ok).count(), 2);
        assert_eq!(counters.get("s1"), 2);
    }

    #[test]
    fn mixed_kinds_fail_the_stage() {
        let (mut boundary, _, _) = boundary(vec![Ok(point("EPSG:4326")), Ok(PayloadItem::Table(TableRow::default()))]);
        assert!(boundary.next().unwrap().is_ok());
        let err = boundary.next().unwrap().unwrap_err();
        let typed = err.downcast::<PipelineError>().unwrap();
        assert_eq!(typed.stage_id(), Some("s1"));
        assert!(boundary.next().is_none());
    }

    #[test]
    fn mixed_crs_fail_the_stage() {
        let (mut boundary, _, _) = boundary(vec![Ok(point("EPSG:4326")), Ok(point("EPSG:3857"))]);
        assert!(boundary.next().unwrap().is_ok());
        assert!(boundary.next().unwrap().is_err());
    }

    #[test]
    fn errors_are_attributed_and_fused() {
        let (mut boundary, _, _) = boundary(vec![Err(anyhow::anyhow!("bad geometry")), Ok(point("EPSG:4326"))]);
        let err = boundary.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("stage 's1' failed: bad geometry"));
        assert!(boundary.next().is_none());
    }

    #[test]
    fn cancellation_stops_pulling() {
        let (mut boundary, counters, cancel) = boundary(vec![Ok(point("EPSG:4326")), Ok(point("EPSG:4326"))]);
        assert!(boundary.next().unwrap().is_ok());
        cancel.cancel();
        let err = boundary.next().unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Cancelled)));
        assert_eq!(counters.get("s1"), 1);
    }
}
