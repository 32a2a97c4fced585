use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

const STATIC_ROUTES: [&str; 2] = ["healthz", "metrics"];

/// Counters for one relay server. Each [`crate::SyncServer`] owns its own sink.
#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_frames_total: Mutex<HashMap<String, u64>>,
    ws_frame_errors_total: Mutex<HashMap<String, u64>>,
    active_rooms: AtomicI64,
    active_connections: AtomicI64,
    slow_peer_disconnects_total: AtomicU64,
    heartbeat_timeouts_total: AtomicU64,
    awareness_expirations_total: AtomicU64,
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

    pub fn record_ws_frame(&self, kind: &str) {
        increment_label_counter(&self.ws_frames_total, &normalize_label(kind), 1);
    }

    pub fn record_ws_frame_error(&self, kind: &str) {
        increment_label_counter(&self.ws_frame_errors_total, &normalize_label(kind), 1);
    }

    pub fn set_active_rooms(&self, rooms: usize) {
        self.active_rooms.store(rooms as i64, Ordering::SeqCst);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn increment_slow_peer_disconnects(&self) {
        self.slow_peer_disconnects_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_heartbeat_timeouts(&self) {
        self.heartbeat_timeouts_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_awareness_expirations(&self, count: usize) {
        self.awareness_expirations_total.fetch_add(count as u64, Ordering::SeqCst);
    }

    pub fn slow_peer_disconnects(&self) -> u64 {
        self.slow_peer_disconnects_total.load(Ordering::SeqCst)
    }

    pub fn heartbeat_timeouts(&self) -> u64 {
        self.heartbeat_timeouts_total.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::SeqCst)
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

        output.push_str("# HELP relay_ws_frames_total Inbound websocket frames by message kind.\n");
        output.push_str("# TYPE relay_ws_frames_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_frames_total", &self.ws_frames_total);

        output.push_str(
            "# HELP relay_ws_frame_errors_total Rejected websocket frames by message kind.\n",
        );
        output.push_str("# TYPE relay_ws_frame_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_frame_errors_total",
            &self.ws_frame_errors_total,
        );

        append_single(
            &mut output,
            "relay_active_rooms",
            "gauge",
            "Rooms with at least one connection.",
            self.active_rooms.load(Ordering::SeqCst),
        );
        append_single(
            &mut output,
            "relay_active_connections",
            "gauge",
            "Open websocket connections.",
            self.active_connections.load(Ordering::SeqCst),
        );
        append_single(
            &mut output,
            "relay_slow_peer_disconnects_total",
            "counter",
            "Connections dropped because their outbound queue was full.",
            self.slow_peer_disconnects_total.load(Ordering::SeqCst),
        );
        append_single(
            &mut output,
            "relay_heartbeat_timeouts_total",
            "counter",
            "Connections dropped after unanswered pings.",
            self.heartbeat_timeouts_total.load(Ordering::SeqCst),
        );
        append_single(
            &mut output,
            "relay_awareness_expirations_total",
            "counter",
            "Presence entries removed by the expiry sweep.",
            self.awareness_expirations_total.load(Ordering::SeqCst),
        );

        output
    }
}

/// Collapses room ids into one label so per-room paths do not explode cardinality.
fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    match segments.as_slice() {
        [] => "/".to_string(),
        [segment] if STATIC_ROUTES.contains(segment) => format!("/{segment}"),
        [_] => "/{room}".to_string(),
        _ => "/{other}".to_string(),
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
    let mut guard = map.lock().unwrap_or_else(PoisonError::into_inner);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().unwrap_or_else(PoisonError::into_inner);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_single(output: &mut String, name: &str, kind: &str, help: &str, value: impl ToString) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {}\n", value.to_string()));
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().unwrap_or_else(PoisonError::into_inner);
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
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().unwrap_or_else(PoisonError::into_inner);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{kind=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
