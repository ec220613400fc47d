use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Point-in-time sizes of the real-time core, published after every sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreGauges {
    pub connections: u64,
    pub rooms: u64,
    pub live_calls: u64,
    pub meshes: u64,
    pub documents_loaded: u64,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    presence_broadcasts_total: Mutex<HashMap<String, u64>>,
    signals_total: Mutex<HashMap<String, u64>>,
    calls_ended_total: Mutex<HashMap<String, u64>>,
    persistence_failures_total: Mutex<HashMap<String, u64>>,
    cleanup_sweeps_total: AtomicU64,
    gauges: Mutex<CoreGauges>,
}

const PRESENCE_OUTCOMES: [&str; 2] = ["sent", "suppressed"];
const SIGNAL_OUTCOMES: [&str; 2] = ["delivered", "dropped"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_rate_total: Mutex::new(HashMap::new()),
            presence_broadcasts_total: Mutex::new(zeroed(&PRESENCE_OUTCOMES)),
            signals_total: Mutex::new(zeroed(&SIGNAL_OUTCOMES)),
            calls_ended_total: Mutex::new(HashMap::new()),
            persistence_failures_total: Mutex::new(HashMap::new()),
            cleanup_sweeps_total: AtomicU64::new(0),
            gauges: Mutex::new(CoreGauges::default()),
        }
    }
}

fn zeroed(labels: &[&str]) -> HashMap<String, u64> {
    labels.iter().map(|label| (label.to_string(), 0)).collect()
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(event: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(event, is_error, latency_ms);
    }
}

pub fn record_presence_broadcast(suppressed: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_presence_broadcast(suppressed);
    }
}

pub fn record_signal(delivered: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_signal(delivered);
    }
}

pub fn record_call_ended(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_call_ended(reason);
    }
}

pub fn record_persistence_failure(operation: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_persistence_failure(operation);
    }
}

pub fn record_cleanup_sweep(gauges: CoreGauges) {
    if let Some(metrics) = global_metrics() {
        metrics.record_cleanup_sweep(gauges);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, event: &str, is_error: bool, latency_ms: u64) {
        let normalized_event = normalize_label(event);
        increment_label_counter(&self.ws_rate_total, &normalized_event, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &normalized_event, latency_ms);
        increment_label_counter(&self.ws_duration_count, &normalized_event, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &normalized_event, 1);
        }
    }

    pub fn record_presence_broadcast(&self, suppressed: bool) {
        let outcome = if suppressed { "suppressed" } else { "sent" };
        increment_label_counter(&self.presence_broadcasts_total, outcome, 1);
    }

    pub fn record_signal(&self, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "dropped" };
        increment_label_counter(&self.signals_total, outcome, 1);
    }

    pub fn record_call_ended(&self, reason: &str) {
        increment_label_counter(&self.calls_ended_total, &normalize_label(reason), 1);
    }

    pub fn record_persistence_failure(&self, operation: &str) {
        increment_label_counter(&self.persistence_failures_total, &normalize_label(operation), 1);
    }

    pub fn record_cleanup_sweep(&self, gauges: CoreGauges) {
        self.cleanup_sweeps_total.fetch_add(1, Ordering::SeqCst);
        *self.gauges.lock().expect("metrics gauge lock poisoned") = gauges;
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_rate_total Total websocket events by type.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", "event", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket events answered with an error.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_errors_total",
            "event",
            &self.ws_errors_total,
        );

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of websocket event handling latency in milliseconds.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            "event",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_duration_ms_count Count of websocket latency samples by event.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            "event",
            &self.ws_duration_count,
        );

        output.push_str("# HELP presence_broadcasts_total Presence changes by broadcast outcome.\n");
        output.push_str("# TYPE presence_broadcasts_total counter\n");
        append_label_counter_lines(
            &mut output,
            "presence_broadcasts_total",
            "outcome",
            &self.presence_broadcasts_total,
        );

        output.push_str("# HELP signals_total Relayed signaling messages by outcome.\n");
        output.push_str("# TYPE signals_total counter\n");
        append_label_counter_lines(&mut output, "signals_total", "outcome", &self.signals_total);

        output.push_str("# HELP calls_ended_total Calls that reached a terminal status by reason.\n");
        output.push_str("# TYPE calls_ended_total counter\n");
        append_label_counter_lines(
            &mut output,
            "calls_ended_total",
            "reason",
            &self.calls_ended_total,
        );

        output.push_str("# HELP persistence_failures_total Writes that failed after every retry.\n");
        output.push_str("# TYPE persistence_failures_total counter\n");
        append_label_counter_lines(
            &mut output,
            "persistence_failures_total",
            "operation",
            &self.persistence_failures_total,
        );

        output.push_str("# HELP cleanup_sweeps_total Completed cleanup sweeps.\n");
        output.push_str("# TYPE cleanup_sweeps_total counter\n");
        output.push_str(&format!(
            "cleanup_sweeps_total {}\n",
            self.cleanup_sweeps_total.load(Ordering::SeqCst)
        ));

        let gauges = *self.gauges.lock().expect("metrics gauge lock poisoned");
        for (name, help, value) in [
            ("realtime_connections", "Open websocket connections.", gauges.connections),
            ("realtime_rooms", "Rooms with at least one member.", gauges.rooms),
            ("realtime_live_calls", "Calls ringing or ongoing.", gauges.live_calls),
            ("realtime_meshes", "Meeting meshes with at least one peer.", gauges.meshes),
            ("realtime_documents_loaded", "Collaborative documents held in memory.", gauges.documents_loaded),
        ] {
            output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"));
        }

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::{CoreGauges, RelayMetrics};

    #[test]
    fn render_prometheus_includes_red_and_realtime_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("GET", "/healthz", 200, 2);
        metrics.record_http_request("GET", "/v1/ws/123", 401, 3);
        metrics.record_ws_request("doc_update", false, 11);
        metrics.record_ws_request("doc_update", true, 19);
        metrics.record_presence_broadcast(false);
        metrics.record_presence_broadcast(true);
        metrics.record_presence_broadcast(true);
        metrics.record_signal(false);
        metrics.record_call_ended("missed");
        metrics.record_persistence_failure("call_record");
        metrics.record_cleanup_sweep(CoreGauges {
            connections: 4,
            rooms: 2,
            live_calls: 1,
            meshes: 0,
            documents_loaded: 3,
        });

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("relay_request_rate_total{method=\"GET\",endpoint=\"/healthz\"} 1"));
        assert!(rendered.contains("endpoint=\"/v1/ws/{number}\""));
        assert!(rendered.contains("relay_ws_rate_total{event=\"doc_update\"} 2"));
        assert!(rendered.contains("relay_ws_errors_total{event=\"doc_update\"} 1"));
        assert!(rendered.contains("presence_broadcasts_total{outcome=\"sent\"} 1"));
        assert!(rendered.contains("presence_broadcasts_total{outcome=\"suppressed\"} 2"));
        assert!(rendered.contains("signals_total{outcome=\"delivered\"} 0"));
        assert!(rendered.contains("signals_total{outcome=\"dropped\"} 1"));
        assert!(rendered.contains("calls_ended_total{reason=\"missed\"} 1"));
        assert!(rendered.contains("persistence_failures_total{operation=\"call_record\"} 1"));
        assert!(rendered.contains("cleanup_sweeps_total 1"));
        assert!(rendered.contains("realtime_connections 4"));
        assert!(rendered.contains("realtime_documents_loaded 3"));
    }
}
