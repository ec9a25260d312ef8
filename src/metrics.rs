use std::fmt::Write;

/// Gauges exported on `/api/metrics`. One snapshot, rendered as Prometheus
/// text lines with the `cloud_browser_` prefix.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub sessions_today: u64,
    pub active_sessions: usize,
    pub queue_length: usize,
    pub pool_size: usize,
    pub pool_warm: usize,
    pub pool_booting: usize,
    pub peak_concurrent: usize,
    pub session_duration_secs: u64,
    pub paused: bool,
}

pub fn render(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    let mut gauge = |name: &str, help: &str, value: u64| {
        let _ = writeln!(out, "# HELP cloud_browser_{} {}", name, help);
        let _ = writeln!(out, "# TYPE cloud_browser_{} gauge", name);
        let _ = writeln!(out, "cloud_browser_{} {}", name, value);
    };

    gauge(
        "sessions_today",
        "Sessions started since local midnight",
        snapshot.sessions_today,
    );
    gauge(
        "active_sessions",
        "Currently active sessions",
        snapshot.active_sessions as u64,
    );
    gauge(
        "queue_length",
        "Entries waiting for admission",
        snapshot.queue_length as u64,
    );
    gauge(
        "pool_size",
        "Containers in the pool",
        snapshot.pool_size as u64,
    );
    gauge(
        "pool_warm",
        "Warm containers ready for sessions",
        snapshot.pool_warm as u64,
    );
    gauge(
        "pool_booting",
        "Containers still booting",
        snapshot.pool_booting as u64,
    );
    gauge(
        "peak_concurrent",
        "Peak concurrent sessions today",
        snapshot.peak_concurrent as u64,
    );
    gauge(
        "session_duration_seconds",
        "Configured session duration",
        snapshot.session_duration_secs,
    );
    gauge("paused", "1 when admission is paused", snapshot.paused as u64);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prefixed_gauges() {
        let rendered = render(&MetricsSnapshot {
            sessions_today: 1,
            active_sessions: 2,
            queue_length: 3,
            pool_size: 4,
            pool_warm: 2,
            pool_booting: 1,
            peak_concurrent: 5,
            session_duration_secs: 300,
            paused: true,
        });

        assert!(rendered.contains("cloud_browser_sessions_today 1"));
        assert!(rendered.contains("cloud_browser_queue_length 3"));
        assert!(rendered.contains("cloud_browser_paused 1"));
        assert!(rendered.contains("# TYPE cloud_browser_pool_warm gauge"));
        // Every line carries the product prefix
        for line in rendered.lines() {
            assert!(
                line.contains("cloud_browser_"),
                "unprefixed line: {}",
                line
            );
        }
    }
}
