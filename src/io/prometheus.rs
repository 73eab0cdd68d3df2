//! Prometheus text exposition of race timer metrics
//!
//! Served at `GET /metrics` by the HTTP adapter.

use crate::domain::types::RaceState;
use crate::infra::metrics::{HistogramSnapshot, MetricsSummary, METRICS_BUCKET_BOUNDS};
use crate::services::broadcaster::SubscriberStatus;
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(output: &mut String, name: &str, help: &str, site: &str, hist: &HistogramSnapshot) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += hist.buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += hist.buckets[hist.buckets.len() - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", hist.sum_us);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {}", hist.count);
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(
    summary: &MetricsSummary,
    race_state: RaceState,
    subscribers: &[SubscriberStatus],
    site: &str,
) -> String {
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "race_timer_uptime_seconds",
        "Process uptime",
        MetricType::Gauge,
        site,
        summary.uptime_secs,
    );
    write_state(&mut output, site, race_state);
    write_race_metrics(&mut output, site, summary);
    write_sensor_metrics(&mut output, site, summary);
    write_command_metrics(&mut output, site, summary);
    write_event_metrics(&mut output, site, summary, subscribers);

    output
}

/// One-hot gauge over all lifecycle states
fn write_state(output: &mut String, site: &str, current: RaceState) {
    let _ = writeln!(output, "# HELP race_timer_state Current race lifecycle state");
    let _ = writeln!(output, "# TYPE race_timer_state gauge");
    for state in [
        RaceState::Idle,
        RaceState::Loaded,
        RaceState::Ready,
        RaceState::Racing,
        RaceState::Finished,
        RaceState::Faulted,
    ] {
        let val = u8::from(state == current);
        let _ = writeln!(output, "race_timer_state{{site=\"{site}\",state=\"{}\"}} {val}", state.as_str());
    }
}

fn write_race_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "race_timer_races_started_total",
        "Races started",
        MetricType::Counter,
        site,
        summary.races_started,
    );
    write_metric(
        output,
        "race_timer_races_finished_total",
        "Races finished with a result",
        MetricType::Counter,
        site,
        summary.races_finished,
    );
    write_metric(
        output,
        "race_timer_races_faulted_total",
        "Races ended by a sensor fault",
        MetricType::Counter,
        site,
        summary.races_faulted,
    );
    write_metric(
        output,
        "race_timer_races_timed_out_total",
        "Races that hit the maximum duration",
        MetricType::Counter,
        site,
        summary.races_timed_out,
    );
}

fn write_sensor_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "race_timer_triggers_total",
        "Gate triggers accepted",
        MetricType::Counter,
        site,
        summary.triggers_accepted,
    );
    write_metric(
        output,
        "race_timer_triggers_debounced_total",
        "Gate triggers suppressed by debounce",
        MetricType::Counter,
        site,
        summary.triggers_debounced,
    );
    write_metric(
        output,
        "race_timer_signals_dropped_total",
        "Sensor signals lost to a full input queue",
        MetricType::Counter,
        site,
        summary.signals_dropped,
    );
    write_metric(
        output,
        "race_timer_readings_rejected_total",
        "Readings ignored by the state machine",
        MetricType::Counter,
        site,
        summary.readings_rejected,
    );
    write_metric(
        output,
        "race_timer_sensor_faults_total",
        "Sensor faults reported",
        MetricType::Counter,
        site,
        summary.sensor_faults,
    );
    write_histogram(
        output,
        "race_timer_input_latency_us",
        "Signal capture to state machine processing in microseconds",
        site,
        &summary.input_latency,
    );
}

fn write_command_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "race_timer_commands_ok_total",
        "Commands acknowledged and applied",
        MetricType::Counter,
        site,
        summary.commands_ok,
    );
    write_metric(
        output,
        "race_timer_commands_rejected_total",
        "Commands refused",
        MetricType::Counter,
        site,
        summary.commands_rejected,
    );
    write_metric(
        output,
        "race_timer_command_timeouts_total",
        "Commands not acknowledged in time",
        MetricType::Counter,
        site,
        summary.command_timeouts,
    );
    write_histogram(
        output,
        "race_timer_ack_latency_us",
        "Hardware acknowledgment latency in microseconds",
        site,
        &summary.ack_latency,
    );
}

fn write_event_metrics(output: &mut String, site: &str, summary: &MetricsSummary, subscribers: &[SubscriberStatus]) {
    write_metric(
        output,
        "race_timer_events_published_total",
        "Outbound events published",
        MetricType::Counter,
        site,
        summary.events_published,
    );
    write_metric(
        output,
        "race_timer_events_overflowed_total",
        "Events dropped from lagging subscriber queues",
        MetricType::Counter,
        site,
        summary.events_overflowed,
    );
    write_metric(
        output,
        "race_timer_subscribers",
        "Connected event subscribers",
        MetricType::Gauge,
        site,
        subscribers.len() as u64,
    );

    let _ = writeln!(output, "# HELP race_timer_subscriber_queued Events waiting per subscriber");
    let _ = writeln!(output, "# TYPE race_timer_subscriber_queued gauge");
    for sub in subscribers {
        let _ = writeln!(
            output,
            "race_timer_subscriber_queued{{site=\"{site}\",subscriber=\"{}\"}} {}",
            sub.name, sub.queued
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::Metrics;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_race_started();
        metrics.record_trigger_accepted();
        metrics.record_ack_latency(150);
        metrics.record_ack_latency(250);
        let subscribers = vec![SubscriberStatus {
            name: "mqtt".to_string(),
            queued: 3,
            delivered: 10,
            dropped: 0,
            lagging: false,
        }];

        let output =
            format_prometheus_metrics(&metrics.report(), RaceState::Racing, &subscribers, "track1");

        assert!(output.contains("race_timer_races_started_total{site=\"track1\"} 1"));
        assert!(output.contains("race_timer_triggers_total{site=\"track1\"} 1"));
        assert!(output.contains("race_timer_state{site=\"track1\",state=\"racing\"} 1"));
        assert!(output.contains("race_timer_state{site=\"track1\",state=\"idle\"} 0"));
        assert!(output.contains("race_timer_ack_latency_us_bucket{site=\"track1\",le=\"200\"} 1"));
        assert!(output.contains("race_timer_ack_latency_us_bucket{site=\"track1\",le=\"+Inf\"} 2"));
        assert!(output.contains("race_timer_ack_latency_us_sum{site=\"track1\"} 400"));
        assert!(output.contains("race_timer_subscriber_queued{site=\"track1\",subscriber=\"mqtt\"} 3"));
    }
}
