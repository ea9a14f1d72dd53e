use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Backend, CancelFlag, LogicalPlan};
use crate::error::{ExploreError, Result};
use crate::join::JoinedView;
use crate::model::KeyValue;
use crate::query::compile::{CompiledRequest, CompiledStat};
use crate::result::{ResultRow, rank_top_n};

const CANCEL_CHECK_INTERVAL: usize = 16 * 1024;

/// Linear interpolation between closest ranks: `h = (n - 1) * q`, then
/// `x[⌊h⌋] + (h - ⌊h⌋) * (x[⌊h⌋ + 1] - x[⌊h⌋])`. `sorted` must be ascending
/// and non-empty. Monotone in `q`, so percentile bands never cross.
pub fn interpolated_percentile(sorted: &[f64], q: f64) -> f64 {
    let last = sorted.len() - 1;
    let h = last as f64 * q;
    let lo = (h.floor() as usize).min(last);
    let hi = (lo + 1).min(last);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Partial aggregate of one group. Partials from different workers merge
/// into the same final state regardless of merge order.
#[derive(Debug, Clone)]
struct GroupState {
    size: u64,
    sums: Vec<f64>,
    values: Vec<Vec<f64>>,
}

impl GroupState {
    fn new(measures: usize) -> Self {
        Self {
            size: 0,
            sums: vec![0.0; measures],
            values: vec![Vec::new(); measures],
        }
    }

    fn add(&mut self, measures: &[f64], keep_values: &[bool]) {
        self.size += 1;
        for (i, &v) in measures.iter().enumerate() {
            self.sums[i] += v;
            if keep_values[i] {
                self.values[i].push(v);
            }
        }
    }

    fn merge(&mut self, other: GroupState) {
        self.size += other.size;
        for (sum, other) in self.sums.iter_mut().zip(other.sums) {
            *sum += other;
        }
        for (values, other) in self.values.iter_mut().zip(other.values) {
            values.extend(other);
        }
    }

    fn finish(mut self, key: Vec<KeyValue>, compiled: &CompiledRequest) -> ResultRow {
        for values in &mut self.values {
            values.sort_by(f64::total_cmp);
        }
        let size = self.size as f64;
        let stats = compiled
            .stats
            .iter()
            .map(|stat| match *stat {
                CompiledStat::Count => size,
                CompiledStat::Mean(m) => self.sums[m] / size,
                CompiledStat::Percentile(m, q) => interpolated_percentile(&self.values[m], q),
            })
            .collect();
        ResultRow {
            key,
            size: self.size,
            stats,
        }
    }
}

type Groups = HashMap<Vec<KeyValue>, GroupState>;

type Worker = JoinHandle<Result<Option<Groups>>>;

async fn drain(workers: impl IntoIterator<Item = Worker>) {
    for worker in workers {
        let _ = worker.await;
    }
}

/// Aggregates one row range. `Ok(None)` means a sibling worker failed and
/// raised `stop`, so the partial result would be thrown away anyway.
fn aggregate_range(
    view: &JoinedView,
    compiled: &CompiledRequest,
    range: Range<usize>,
    cancel: &CancelFlag,
    stop: &CancelFlag,
    group_cap: Option<usize>,
) -> Result<Option<Groups>> {
    let mut groups = Groups::new();
    let (mut derived, mut measures) = (Vec::new(), Vec::new());

    for (n, row) in view.base_rows()[range].iter().enumerate() {
        if n % CANCEL_CHECK_INTERVAL == 0 {
            if cancel.is_cancelled() {
                return Err(ExploreError::BackendUnavailable("job cancelled".into()));
            }
            if stop.is_cancelled() {
                return Ok(None);
            }
        }
        if !view.contains(row) {
            continue;
        }
        let Some(key) = compiled.admit(row, &mut derived, &mut measures) else {
            continue;
        };
        groups
            .entry(key)
            .or_insert_with(|| GroupState::new(compiled.measure_count()))
            .add(&measures, &compiled.keep_values);

        if let Some(cap) = group_cap {
            if groups.len() > cap {
                return Err(ExploreError::ResultTooLarge {
                    rows: groups.len(),
                    cap,
                });
            }
        }
    }
    Ok(Some(groups))
}

/// In-process executor. The view is cut into one row range per worker,
/// each range is aggregated on a blocking thread, and the partial group
/// states are merged. Only grouped rows leave [`Backend::submit`].
#[derive(Debug, Clone)]
pub struct LocalBackend {
    workers: usize,
    permits: Arc<Semaphore>,
}

impl LocalBackend {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

#[async_trait]
impl Backend for LocalBackend {
    #[tracing::instrument(skip_all, fields(view = plan.source.name(), workers = self.workers))]
    async fn submit(&self, plan: &LogicalPlan) -> Result<Vec<ResultRow>> {
        let compiled = Arc::new(CompiledRequest::new(&plan.request)?);
        // with top-n only the ranked survivors travel back
        let group_cap = compiled.top_n.is_none().then_some(plan.row_cap);

        let len = plan.source.base_len();
        let chunk = len.div_ceil(self.workers).max(1);
        let mut tasks = Vec::with_capacity(self.workers);

        // raised on the first failure so the remaining workers quit early
        let stop = CancelFlag::new();

        for start in (0..len).step_by(chunk) {
            let range = start..(start + chunk).min(len);
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    stop.cancel();
                    drain(tasks).await;
                    return Err(ExploreError::BackendUnavailable("worker pool closed".into()));
                }
            };
            let view = plan.source.clone();
            let compiled = compiled.clone();
            let cancel = plan.cancel.clone();
            let stop = stop.clone();

            tasks.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let partial = aggregate_range(&view, &compiled, range, &cancel, &stop, group_cap);
                if partial.is_err() {
                    stop.cancel();
                }
                partial
            }));
        }

        let mut groups = Groups::new();
        let mut failure = None;
        let mut pending = tasks.into_iter();
        while let Some(task) = pending.next() {
            let partial = match task.await {
                Ok(Ok(Some(partial))) => partial,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    failure = Some(ExploreError::BackendUnavailable(format!("worker failed: {e}")));
                    break;
                }
            };
            for (key, state) in partial {
                match groups.get_mut(&key) {
                    Some(existing) => existing.merge(state),
                    None => {
                        groups.insert(key, state);
                    }
                }
            }
            if let Some(cap) = group_cap {
                if groups.len() > cap {
                    failure = Some(ExploreError::ResultTooLarge {
                        rows: groups.len(),
                        cap,
                    });
                    break;
                }
            }
        }
        if let Some(e) = failure {
            stop.cancel();
            // workers exit within one check interval; wait so their permits are back
            drain(pending).await;
            debug!(error = %e, "Local aggregation abandoned");
            return Err(e);
        }

        let mut rows: Vec<ResultRow> = groups
            .into_iter()
            .map(|(key, state)| state.finish(key, &compiled))
            .collect();
        if let Some(n) = compiled.top_n {
            rank_top_n(&mut rows, n);
        }
        debug!(groups = rows.len(), "Local aggregation finished");
        Ok(rows)
    }
}
