//! 管线各阶段的结构化事件。日志始终产出，指标只在
//! prometheus 启用后上报。

use std::time::Duration;

use metrics::{counter, histogram};
use tracing::{info, warn};

use super::metrics::prometheus_enabled;

pub fn simulation_gate(batch_size: usize, passed: bool, elapsed: Duration) {
    info!(
        target: "monitoring::pipeline",
        event = "simulation_gate",
        batch_size,
        passed,
        elapsed_ms = elapsed.as_millis() as u64,
        "simulation gate finished"
    );

    if prometheus_enabled() {
        let result = if passed { "passed" } else { "rejected" };
        counter!("magellan_simulation_gate_total", "result" => result).increment(1);
        histogram!("magellan_simulation_gate_seconds").record(elapsed.as_secs_f64());
    }
}

pub fn channel_attempt(channel: &str) {
    info!(
        target: "monitoring::dispatch",
        event = "channel_attempt",
        channel,
        "dispatch channel attempt"
    );

    if prometheus_enabled() {
        counter!("magellan_channel_attempts_total", "channel" => channel.to_string()).increment(1);
    }
}

pub fn channel_success(channel: &str) {
    info!(
        target: "monitoring::dispatch",
        event = "channel_success",
        channel,
        "dispatch channel succeeded"
    );

    if prometheus_enabled() {
        counter!("magellan_channel_success_total", "channel" => channel.to_string()).increment(1);
    }
}

pub fn channel_failure(channel: &str) {
    warn!(
        target: "monitoring::dispatch",
        event = "channel_failure",
        channel,
        "dispatch channel failed"
    );

    if prometheus_enabled() {
        counter!("magellan_channel_failure_total", "channel" => channel.to_string()).increment(1);
    }
}

pub fn confirmation_outcome(kind: &str, outcome: &str, elapsed: Duration) {
    info!(
        target: "monitoring::confirm",
        event = "confirmation_outcome",
        kind,
        outcome,
        elapsed_ms = elapsed.as_millis() as u64,
        "confirmation finished"
    );

    if prometheus_enabled() {
        counter!(
            "magellan_confirmations_total",
            "kind" => kind.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        histogram!("magellan_confirmation_seconds", "kind" => kind.to_string())
            .record(elapsed.as_secs_f64());
    }
}

pub fn pipeline_terminal(status: &str, batch_size: usize, landed: usize, elapsed: Duration) {
    info!(
        target: "monitoring::pipeline",
        event = "pipeline_terminal",
        status,
        batch_size,
        landed,
        elapsed_ms = elapsed.as_millis() as u64,
        "pipeline run finished"
    );

    if prometheus_enabled() {
        counter!("magellan_pipeline_runs_total", "status" => status.to_string()).increment(1);
        histogram!("magellan_pipeline_seconds", "status" => status.to_string())
            .record(elapsed.as_secs_f64());
        histogram!("magellan_pipeline_batch_size").record(batch_size as f64);
    }
}

pub fn tip_floor_update(level: &str, lamports: u64) {
    info!(
        target: "monitoring::tipfloor",
        event = "tip_floor_update",
        level,
        lamports,
        "tip floor refreshed"
    );

    if prometheus_enabled() {
        histogram!("magellan_tip_floor_lamports", "level" => level.to_string())
            .record(lamports as f64);
    }
}

pub fn supervisor_restart(task: &str, attempt: usize, backoff: Duration) {
    warn!(
        target: "monitoring::supervisor",
        event = "supervisor_restart",
        task,
        attempt,
        backoff_ms = backoff.as_millis() as u64,
        "task restarting after failure"
    );

    if prometheus_enabled() {
        counter!("magellan_supervisor_restarts_total", "task" => task.to_string()).increment(1);
    }
}
