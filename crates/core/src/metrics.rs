use crate::types::{AgentId, ExecutionContext, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Latency buckets in milliseconds
const LATENCY_BUCKETS_MS: [f64; 10] = [
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0,
];

/// Aggregate view over stored executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_executions: usize,
    pub pending_executions: usize,
    pub running_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub cancelled_executions: usize,
    /// Mean run time of finished executions
    pub average_execution_secs: f64,
    pub total_execution_secs: f64,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl ExecutionMetrics {
    pub fn from_executions<'a>(executions: impl IntoIterator<Item = &'a ExecutionContext>) -> Self {
        let mut metrics = Self::default();
        let mut finished = 0usize;

        for execution in executions {
            metrics.total_executions += 1;
            match execution.status {
                ExecutionStatus::Pending => metrics.pending_executions += 1,
                ExecutionStatus::Running => metrics.running_executions += 1,
                ExecutionStatus::Completed => metrics.successful_executions += 1,
                ExecutionStatus::Failed => metrics.failed_executions += 1,
                ExecutionStatus::Cancelled => metrics.cancelled_executions += 1,
            }

            if let Some(secs) = execution.duration_secs() {
                metrics.total_execution_secs += secs;
                finished += 1;
            }

            if metrics
                .last_execution_at
                .map_or(true, |last| execution.created_at > last)
            {
                metrics.last_execution_at = Some(execution.created_at);
            }
        }

        if finished > 0 {
            metrics.average_execution_secs = metrics.total_execution_secs / finished as f64;
        }
        metrics
    }
}

/// Bucketed latency distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    /// Cumulative: `counts[i]` is the number of observations `<= buckets[i]`
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: LATENCY_BUCKETS_MS.to_vec(),
            counts: vec![0; LATENCY_BUCKETS_MS.len()],
            sum: 0.0,
            count: 0,
        }
    }
}

impl Histogram {
    pub fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (bucket, count) in self.buckets.iter().zip(self.counts.iter_mut()) {
            if value <= *bucket {
                *count += 1;
            }
        }
    }

    /// Upper bound of the bucket holding the p-th percentile
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=100.0).contains(&p) {
            return None;
        }

        let target = ((self.count as f64) * (p / 100.0)).ceil() as u64;
        self.buckets
            .iter()
            .zip(&self.counts)
            .find(|(_, count)| **count >= target)
            .map(|(bucket, _)| *bucket)
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Dispatch outcomes for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDispatchStats {
    pub agent_id: Option<AgentId>,
    pub dispatched: u64,
    pub failed: u64,
    pub latency_ms: Histogram,
    pub last_dispatch_at: Option<DateTime<Utc>>,
}

/// In-process counters for node dispatches, keyed by agent
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    agents: Mutex<HashMap<Option<AgentId>, AgentDispatchStats>>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent_id: Option<&AgentId>, elapsed_ms: u64, success: bool) {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        let stats = agents
            .entry(agent_id.cloned())
            .or_insert_with(|| AgentDispatchStats {
                agent_id: agent_id.cloned(),
                ..Default::default()
            });

        stats.dispatched += 1;
        if !success {
            stats.failed += 1;
        }
        stats.latency_ms.observe(elapsed_ms as f64);
        stats.last_dispatch_at = Some(Utc::now());
    }

    /// Snapshot ordered by agent id; unassigned nodes sort first
    pub fn snapshot(&self) -> Vec<AgentDispatchStats> {
        let agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats: Vec<AgentDispatchStats> = agents.values().cloned().collect();
        stats.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionId, ExecutionRequest, JsonObject, StatusUpdate};

    fn finished(status: ExecutionStatus) -> ExecutionContext {
        let request = ExecutionRequest::new("flow", JsonObject::new());
        let mut ctx = ExecutionContext::pending(ExecutionId::new(), &request);
        ctx.transition(ExecutionStatus::Running, StatusUpdate::default())
            .unwrap();
        ctx.transition(status, StatusUpdate::default()).unwrap();
        ctx.started_at = Some(ctx.created_at);
        ctx.completed_at = Some(ctx.created_at + chrono::Duration::seconds(2));
        ctx
    }

    #[test]
    fn test_execution_metrics_counts_and_durations() {
        let mut executions = vec![
            finished(ExecutionStatus::Completed),
            finished(ExecutionStatus::Failed),
            finished(ExecutionStatus::Cancelled),
        ];
        let request = ExecutionRequest::new("flow", JsonObject::new());
        let mut pending = ExecutionContext::pending(ExecutionId::new(), &request);
        pending.created_at += chrono::Duration::seconds(10);
        executions.push(pending.clone());

        let metrics = ExecutionMetrics::from_executions(&executions);
        assert_eq!(metrics.total_executions, 4);
        assert_eq!(metrics.successful_executions, 1);
        assert_eq!(metrics.failed_executions, 1);
        assert_eq!(metrics.cancelled_executions, 1);
        assert_eq!(metrics.pending_executions, 1);
        assert_eq!(metrics.total_execution_secs, 6.0);
        assert_eq!(metrics.average_execution_secs, 2.0);
        assert_eq!(metrics.last_execution_at, Some(pending.created_at));
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = ExecutionMetrics::from_executions(std::iter::empty());
        assert_eq!(metrics, ExecutionMetrics::default());
    }

    #[test]
    fn test_histogram_percentile() {
        let mut histogram = Histogram::default();
        for value in [5.0, 20.0, 80.0, 90.0, 400.0, 4_000.0] {
            histogram.observe(value);
        }

        assert_eq!(histogram.count, 6);
        assert_eq!(histogram.percentile(50.0), Some(100.0));
        assert_eq!(histogram.percentile(100.0), Some(5_000.0));
        assert_eq!(histogram.percentile(120.0), None);
        assert!(Histogram::default().average().is_none());
    }

    #[test]
    fn test_dispatch_metrics_per_agent() {
        let metrics = DispatchMetrics::new();
        let scorer = AgentId::new("scorer");

        metrics.record(Some(&scorer), 40, true);
        metrics.record(Some(&scorer), 60, false);
        metrics.record(None, 0, false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].agent_id.is_none());
        assert_eq!(snapshot[1].dispatched, 2);
        assert_eq!(snapshot[1].failed, 1);
        assert_eq!(snapshot[1].latency_ms.average(), Some(50.0));
    }
}
