//! Per-task context handed to every map and reduce call.
//!
//! The engine that runs a workload owns the counters and the logging span;
//! workloads only ever see them through a [`TaskContext`].

use dashmap::DashMap;
use std::sync::Arc;
use tracing::Span;

/// A sink for named counters, supplied by whoever drives the job.
pub trait Counters: Send + Sync {
    /// Adds `n` to the counter `name` within `group`.
    fn add(&self, group: &str, name: &str, n: u64);

    /// Adds one to the counter `name` within `group`.
    fn increment(&self, group: &str, name: &str) {
        self.add(group, name, 1);
    }
}

/// Discards every increment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCounters;

impl Counters for NoopCounters {
    fn add(&self, _group: &str, _name: &str, _n: u64) {}
}

/// Keeps counters in memory so the driver can report them after a job.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    values: DashMap<(String, String), u64>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if it was never touched.
    pub fn get(&self, group: &str, name: &str) -> u64 {
        self.values
            .get(&(group.to_string(), name.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// All counters sorted by group, then name.
    pub fn snapshot(&self) -> Vec<(String, String, u64)> {
        let mut out: Vec<_> = self
            .values
            .iter()
            .map(|entry| {
                let (group, name) = entry.key();
                (group.clone(), name.clone(), *entry.value())
            })
            .collect();
        out.sort();
        out
    }
}

impl Counters for MemoryCounters {
    fn add(&self, group: &str, name: &str, n: u64) {
        *self
            .values
            .entry((group.to_string(), name.to_string()))
            .or_insert(0) += n;
    }
}

/// What a single map or reduce invocation may use besides its input.
#[derive(Clone)]
pub struct TaskContext {
    counters: Arc<dyn Counters>,
    span: Span,
}

impl TaskContext {
    pub fn new(counters: Arc<dyn Counters>, span: Span) -> Self {
        Self { counters, span }
    }

    /// A context with no counters and a disabled span. Handy in tests.
    pub fn detached() -> Self {
        Self::new(Arc::new(NoopCounters), Span::none())
    }

    /// The span every event of this task should be parented on.
    #[inline]
    pub fn span(&self) -> &Span {
        &self.span
    }

    #[inline]
    pub fn counters(&self) -> &dyn Counters {
        self.counters.as_ref()
    }

    #[inline]
    pub fn increment(&self, group: &str, name: &str) {
        self.counters.increment(group, name);
    }

    /// Same counters, nested span.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            counters: self.counters.clone(),
            span,
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}
