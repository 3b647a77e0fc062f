//! Priority batching of output-variable writes with change detection.
//!
//! Every source proposes whole batches each frame; only values that differ
//! from what the surface already shows are written, which during steady
//! playback skips the large majority of proposals.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{color::Rgb, config::BatcherConfig, Result};

/// Flush order. Lower variants are applied first and are starved last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Background,
}

/// Value carried by an output variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Number(f32),
    Color(Rgb),
    Text(String),
}

impl OutputValue {
    /// Equality used for change detection; numbers compare within `epsilon`.
    pub fn same_as(&self, other: &OutputValue, epsilon: f32) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a - b).abs() <= epsilon,
            _ => self == other,
        }
    }

    pub fn as_number(&self) -> Option<f32> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value:.3}"),
            Self::Color(rgb) => write!(f, "{rgb}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<f32> for OutputValue {
    fn from(value: f32) -> Self {
        Self::Number(value)
    }
}

impl From<f64> for OutputValue {
    fn from(value: f64) -> Self {
        Self::Number(value as f32)
    }
}

impl From<Rgb> for OutputValue {
    fn from(value: Rgb) -> Self {
        Self::Color(value)
    }
}

impl From<&str> for OutputValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A group of writes proposed together by one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputVariableBatch {
    pub source: String,
    pub variables: BTreeMap<String, OutputValue>,
    pub priority: Priority,
    pub reason: String,
}

impl OutputVariableBatch {
    pub fn new(source: impl Into<String>, priority: Priority, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            variables: BTreeMap::new(),
            priority,
            reason: reason.into(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<OutputValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<OutputValue>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// Destination of the flushed writes, typically a renderer's variable table.
pub trait OutputSurface: Send {
    /// Applies all writes or none of them.
    fn apply(&mut self, writes: &[(String, OutputValue)]) -> Result<()>;
}

/// Outcome of a single flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Variables written to the surface.
    pub applied: usize,
    /// Proposed values equal to what the surface already shows.
    pub skipped: usize,
    /// Values shadowed by a higher-priority batch in the same flush.
    pub superseded: usize,
    /// Batches left queued because the frame budget ran out.
    pub deferred: usize,
    /// Batches discarded after exhausting their retries or overflowing the
    /// queue.
    pub dropped: usize,
    pub write_failed: bool,
}

/// Totals across all flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub flushes: u64,
    /// Also counts queued values replaced by a newer proposal before any
    /// flush.
    pub applied: u64,
    pub skipped: u64,
    pub superseded: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub write_failures: u64,
}

impl BatcherStats {
    /// Share of proposed values that did not need writing.
    pub fn skip_rate(&self) -> f32 {
        let total = self.applied + self.skipped;
        if total == 0 {
            0.0
        } else {
            self.skipped as f32 / total as f32
        }
    }
}

#[derive(Debug)]
struct QueuedBatch {
    batch: OutputVariableBatch,
    seq: u64,
    attempts: u32,
    deferrals: u32,
}

/// Bookkeeping from merging one batch into the queue.
#[derive(Debug, Default)]
struct Enqueued {
    superseded: usize,
    dropped: usize,
}

pub struct OutputVariableBatcher {
    config: BatcherConfig,
    surface: Box<dyn OutputSurface>,
    queue: Vec<QueuedBatch>,
    last_applied: HashMap<String, OutputValue>,
    next_seq: u64,
    stats: BatcherStats,
}

impl OutputVariableBatcher {
    pub fn new(surface: Box<dyn OutputSurface>, config: BatcherConfig) -> Self {
        Self {
            config,
            surface,
            queue: Vec::new(),
            last_applied: HashMap::new(),
            next_seq: 0,
            stats: BatcherStats::default(),
        }
    }

    /// Queues a batch. A critical batch flushes immediately when early
    /// flushing is enabled, and the report of that flush is returned.
    pub fn propose(&mut self, batch: OutputVariableBatch) -> Option<FlushReport> {
        if batch.is_empty() {
            return None;
        }

        let early = batch.priority == Priority::Critical && self.config.early_flush_on_critical;
        let queued = QueuedBatch {
            batch,
            seq: self.next_seq,
            attempts: 0,
            deferrals: 0,
        };
        self.next_seq += 1;

        let merged = self.enqueue(queued);
        self.stats.superseded += merged.superseded as u64;
        self.stats.dropped += merged.dropped as u64;

        early.then(|| self.flush())
    }

    /// Merges `incoming` into the queue so each variable keeps one value per
    /// priority, the most recently proposed one. Values in an older batch of
    /// the same or lower priority are replaced; values a newer batch of the
    /// same or higher priority already holds are discarded from `incoming`.
    fn enqueue(&mut self, mut incoming: QueuedBatch) -> Enqueued {
        let mut merged = Enqueued::default();

        for queued in &mut self.queue {
            if queued.seq < incoming.seq && queued.batch.priority >= incoming.batch.priority {
                let before = queued.batch.variables.len();
                queued
                    .batch
                    .variables
                    .retain(|name, _| !incoming.batch.variables.contains_key(name));
                let replaced = before - queued.batch.variables.len();
                if replaced > 0 {
                    merged.superseded += replaced;
                    // a value re-proposed every frame keeps ageing
                    incoming.deferrals = incoming.deferrals.max(queued.deferrals);
                }
            } else if queued.seq > incoming.seq
                && queued.batch.priority <= incoming.batch.priority
            {
                let before = incoming.batch.variables.len();
                incoming
                    .batch
                    .variables
                    .retain(|name, _| !queued.batch.variables.contains_key(name));
                merged.superseded += before - incoming.batch.variables.len();
            }
        }

        self.queue.retain(|queued| !queued.batch.is_empty());
        if !incoming.batch.is_empty() {
            self.queue.push(incoming);
        }

        while self.queue.len() > self.config.max_queued_batches {
            let Some(victim) = self
                .queue
                .iter()
                .enumerate()
                .max_by_key(|(_, queued)| (queued.batch.priority, Reverse(queued.seq)))
                .map(|(index, _)| index)
            else {
                break;
            };
            let victim = self.queue.remove(victim);
            merged.dropped += 1;
            warn!(
                source = %victim.batch.source,
                reason = %victim.batch.reason,
                priority = ?victim.batch.priority,
                queued = self.queue.len(),
                "output queue full, dropping batch"
            );
        }
        merged
    }

    /// Writes the changed subset of all queued batches to the surface.
    pub fn flush(&mut self) -> FlushReport {
        let started = Instant::now();
        let budget = Duration::try_from_secs_f32(self.config.frame_budget_ms.max(0.0) / 1000.0)
            .unwrap_or(Duration::MAX);
        let epsilon = self.config.number_epsilon;

        let mut pending = std::mem::take(&mut self.queue);
        pending.sort_by_key(|queued| (queued.batch.priority, queued.seq));

        let mut report = FlushReport::default();
        let mut staged: BTreeMap<String, OutputValue> = BTreeMap::new();
        let mut consumed = Vec::new();
        let mut deferred = Vec::new();

        for mut queued in pending {
            let over_budget = staged.len() >= self.config.max_writes_per_flush
                || started.elapsed() >= budget;
            if queued.batch.priority != Priority::Critical
                && over_budget
                && queued.deferrals < self.config.max_deferrals
            {
                queued.deferrals += 1;
                deferred.push(queued);
                continue;
            }

            for (name, value) in &queued.batch.variables {
                if staged.contains_key(name) {
                    report.superseded += 1;
                    continue;
                }
                let unchanged = self
                    .last_applied
                    .get(name)
                    .is_some_and(|applied| applied.same_as(value, epsilon));
                if unchanged {
                    report.skipped += 1;
                } else {
                    staged.insert(name.clone(), value.clone());
                }
            }
            consumed.push(queued);
        }

        report.deferred = deferred.len();
        self.queue = deferred;

        let writes: Vec<(String, OutputValue)> = staged.into_iter().collect();
        let outcome = if writes.is_empty() {
            Ok(())
        } else {
            self.surface.apply(&writes)
        };

        match outcome {
            Ok(()) => {
                report.applied = writes.len();
                self.last_applied.extend(writes);
            }
            Err(err) => {
                report.write_failed = true;
                report.skipped = 0;
                self.stats.write_failures += 1;
                warn!(error = %err, batches = consumed.len(), "output surface write failed, retrying next flush");
                for mut queued in consumed {
                    queued.attempts += 1;
                    if queued.attempts > self.config.max_retries {
                        report.dropped += 1;
                        error!(
                            source = %queued.batch.source,
                            reason = %queued.batch.reason,
                            attempts = queued.attempts,
                            "dropping output batch after repeated write failures"
                        );
                    } else {
                        let merged = self.enqueue(queued);
                        report.superseded += merged.superseded;
                        report.dropped += merged.dropped;
                    }
                }
                self.queue.sort_by_key(|queued| queued.seq);
            }
        }

        self.stats.flushes += 1;
        self.stats.applied += report.applied as u64;
        self.stats.skipped += report.skipped as u64;
        self.stats.superseded += report.superseded as u64;
        self.stats.deferred += report.deferred as u64;
        self.stats.dropped += report.dropped as u64;

        if report.deferred > 0 {
            debug!(deferred = report.deferred, "frame budget exhausted, batches deferred");
        }
        report
    }

    /// Value the surface currently shows for `name`, as far as this batcher
    /// knows.
    pub fn last_applied(&self, name: &str) -> Option<&OutputValue> {
        self.last_applied.get(name)
    }

    /// Forgets what was written so the next flush rewrites everything, e.g.
    /// after the renderer reloads.
    pub fn invalidate_applied(&mut self) {
        self.last_applied.clear();
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> BatcherStats {
        self.stats
    }
}

impl fmt::Debug for OutputVariableBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputVariableBatcher")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .field("applied_variables", &self.last_applied.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RecordingSurface;

    fn config() -> BatcherConfig {
        BatcherConfig {
            frame_budget_ms: 1_000.0,
            ..BatcherConfig::default()
        }
    }

    fn batcher() -> (OutputVariableBatcher, RecordingSurface) {
        let surface = RecordingSurface::new();
        let batcher = OutputVariableBatcher::new(Box::new(surface.clone()), config());
        (batcher, surface)
    }

    fn batch(priority: Priority) -> OutputVariableBatch {
        OutputVariableBatch::new("test", priority, "unit")
            .with("--a", 0.5)
            .with("--b", Rgb::new(10, 20, 30))
    }

    #[test]
    fn identical_batch_is_skipped_on_second_flush() {
        let (mut batcher, surface) = batcher();

        batcher.propose(batch(Priority::Normal));
        let first = batcher.flush();
        assert_eq!(first.applied, 2);
        assert_eq!(surface.write_calls(), 1);

        batcher.propose(batch(Priority::Normal));
        let second = batcher.flush();
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(surface.write_calls(), 1);
        assert_eq!(batcher.stats().skipped, 2);
    }

    #[test]
    fn only_changed_values_are_written() {
        let (mut batcher, surface) = batcher();
        batcher.propose(batch(Priority::Normal));
        batcher.flush();

        batcher.propose(batch(Priority::Normal).with("--a", 0.75));
        let report = batcher.flush();
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(surface.value("--a"), Some(OutputValue::Number(0.75)));
    }

    #[test]
    fn tiny_numeric_changes_are_ignored() {
        let (mut batcher, _surface) = batcher();
        batcher.propose(OutputVariableBatch::new("s", Priority::Normal, "r").with("--x", 0.5));
        batcher.flush();
        batcher.propose(OutputVariableBatch::new("s", Priority::Normal, "r").with("--x", 0.50001));
        assert_eq!(batcher.flush().applied, 0);
    }

    #[test]
    fn higher_priority_wins_within_a_flush() {
        let (mut batcher, surface) = batcher();
        batcher.propose(OutputVariableBatch::new("bg", Priority::Background, "r").with("--x", 1.0));
        batcher.propose(OutputVariableBatch::new("hi", Priority::High, "r").with("--x", 2.0));

        let report = batcher.flush();
        assert_eq!(report.applied, 1);
        assert_eq!(report.superseded, 1);
        assert_eq!(surface.value("--x"), Some(OutputValue::Number(2.0)));
    }

    #[test]
    fn critical_batch_flushes_early() {
        let (mut batcher, surface) = batcher();
        batcher.propose(batch(Priority::Background));
        let report = batcher
            .propose(OutputVariableBatch::new("palette", Priority::Critical, "track change").with("--c", 1.0))
            .expect("critical batches flush immediately");

        assert_eq!(report.applied, 3);
        assert_eq!(surface.write_calls(), 1);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn lower_priorities_are_deferred_when_over_budget() {
        let surface = RecordingSurface::new();
        let mut batcher = OutputVariableBatcher::new(
            Box::new(surface.clone()),
            BatcherConfig {
                max_writes_per_flush: 2,
                ..config()
            },
        );

        batcher.propose(OutputVariableBatch::new("bg", Priority::Background, "r").with("--bg", 1.0));
        batcher.propose(batch(Priority::High));

        let report = batcher.flush();
        assert_eq!(report.applied, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(surface.value("--bg"), None);

        let report = batcher.flush();
        assert_eq!(report.applied, 1);
        assert_eq!(surface.value("--bg"), Some(OutputValue::Number(1.0)));
    }

    #[test]
    fn failed_writes_are_retried_then_dropped() {
        let (mut batcher, surface) = batcher();
        surface.fail_writes(true);
        batcher.propose(batch(Priority::Normal));

        for _ in 0..3 {
            let report = batcher.flush();
            assert!(report.write_failed);
            assert_eq!(batcher.pending(), 1);
        }

        let report = batcher.flush();
        assert_eq!(report.dropped, 1);
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.stats().write_failures, 4);
    }

    #[test]
    fn retried_batch_lands_once_surface_recovers() {
        let (mut batcher, surface) = batcher();
        surface.fail_writes(true);
        batcher.propose(batch(Priority::Normal));
        batcher.flush();

        surface.fail_writes(false);
        let report = batcher.flush();
        assert_eq!(report.applied, 2);
        assert_eq!(batcher.last_applied("--a"), Some(&OutputValue::Number(0.5)));
    }

    #[test]
    fn newer_value_replaces_a_failed_write() {
        let (mut batcher, surface) = batcher();
        surface.fail_writes(true);
        batcher.propose(OutputVariableBatch::new("s", Priority::Normal, "r").with("--x", 1.0));
        assert!(batcher.flush().write_failed);

        surface.fail_writes(false);
        batcher.propose(OutputVariableBatch::new("s", Priority::Normal, "r").with("--x", 2.0));
        assert_eq!(batcher.pending(), 1);

        let report = batcher.flush();
        assert_eq!(report.applied, 1);
        assert_eq!(report.superseded, 0);
        assert_eq!(surface.value("--x"), Some(OutputValue::Number(2.0)));
        assert_eq!(batcher.stats().superseded, 1);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn deferred_batches_are_eventually_written() {
        let surface = RecordingSurface::new();
        let mut batcher = OutputVariableBatcher::new(
            Box::new(surface.clone()),
            BatcherConfig {
                max_writes_per_flush: 2,
                ..config()
            },
        );

        for tick in 0..100 {
            let value = tick as f32;
            batcher.propose(
                OutputVariableBatch::new("beat", Priority::High, "pulse")
                    .with("--a", value)
                    .with("--b", value),
            );
            batcher.propose(OutputVariableBatch::new("mood", Priority::Normal, "drift").with("--x", value));
            batcher.flush();
            assert!(batcher.pending() <= 1, "queue grew to {}", batcher.pending());
        }
        assert!(surface.value("--x").is_some());

        batcher.flush();
        assert_eq!(surface.value("--x"), Some(OutputValue::Number(99.0)));
    }

    #[test]
    fn full_queue_drops_oldest_low_priority_batches() {
        let surface = RecordingSurface::new();
        let mut batcher = OutputVariableBatcher::new(
            Box::new(surface),
            BatcherConfig {
                max_queued_batches: 4,
                ..config()
            },
        );

        for i in 0..10 {
            batcher.propose(
                OutputVariableBatch::new("bg", Priority::Background, "r").with(format!("--v{i}"), 1.0),
            );
        }
        batcher.propose(OutputVariableBatch::new("hi", Priority::High, "r").with("--h", 1.0));

        assert_eq!(batcher.pending(), 4);
        assert_eq!(batcher.stats().dropped, 7);
        batcher.flush();
        assert_eq!(batcher.last_applied("--h"), Some(&OutputValue::Number(1.0)));
        assert_eq!(batcher.last_applied("--v9"), Some(&OutputValue::Number(1.0)));
        assert_eq!(batcher.last_applied("--v6"), None);
    }

    #[test]
    fn huge_frame_budget_does_not_panic() {
        let (surface, config) = (
            RecordingSurface::new(),
            BatcherConfig {
                frame_budget_ms: 1e30,
                ..BatcherConfig::default()
            },
        );
        let mut batcher = OutputVariableBatcher::new(Box::new(surface), config);
        batcher.propose(batch(Priority::Normal));
        assert_eq!(batcher.flush().applied, 2);
    }

    #[test]
    fn empty_batches_are_ignored() {
        let (mut batcher, _surface) = batcher();
        assert!(batcher
            .propose(OutputVariableBatch::new("s", Priority::Critical, "nothing"))
            .is_none());
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn invalidating_rewrites_everything() {
        let (mut batcher, surface) = batcher();
        batcher.propose(batch(Priority::Normal));
        batcher.flush();
        batcher.invalidate_applied();
        batcher.propose(batch(Priority::Normal));
        assert_eq!(batcher.flush().applied, 2);
        assert_eq!(surface.write_calls(), 2);
    }

    #[test]
    fn skip_rate_reflects_totals() {
        let stats = BatcherStats {
            applied: 1,
            skipped: 9,
            ..Default::default()
        };
        assert!((stats.skip_rate() - 0.9).abs() < 1e-6);
        assert_eq!(BatcherStats::default().skip_rate(), 0.0);
    }
}
