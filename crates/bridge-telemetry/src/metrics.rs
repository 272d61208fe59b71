use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Metric names recorded by the bridge.
pub mod names {
    pub const SESSIONS_ACTIVE: &str = "bridge.sessions.active";
    pub const CALLS_OPENED: &str = "bridge.calls.opened";
    pub const CALLS_FINISHED: &str = "bridge.calls.finished";
    pub const PROTOCOL_VIOLATIONS: &str = "bridge.protocol_violations";
    pub const DECODE_ERRORS: &str = "bridge.decode_errors";
    pub const CALL_DURATION_MS: &str = "bridge.call.duration_ms";
}

/// Histograms keep at most this many recent observations.
const HISTOGRAM_RESERVOIR: usize = 4096;

/// Type of metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// A snapshot of a metric value at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

/// Query parameters for searching metrics.
#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    /// Every pair must be present on the snapshot.
    pub labels: Option<HashMap<String, String>>,
    pub limit: Option<u32>,
}

struct Counter(AtomicU64);

impl Counter {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }
    fn increment(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// f64 stored as raw bits so it can be updated atomically.
struct Gauge(AtomicU64);

impl Gauge {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
    fn increment(&self, delta: f64) {
        let _ = self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + delta).to_bits())
        });
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Sliding window of recent observations plus lifetime count and sum.
struct Histogram {
    inner: Mutex<HistogramInner>,
}

struct HistogramInner {
    recent: VecDeque<f64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HistogramInner {
                recent: VecDeque::new(),
                count: 0,
                sum: 0.0,
            }),
        }
    }

    fn observe(&self, value: f64) {
        let mut inner = self.inner.lock();
        if inner.recent.len() == HISTOGRAM_RESERVOIR {
            inner.recent.pop_front();
        }
        inner.recent.push_back(value);
        inner.count += 1;
        inner.sum += value;
    }

    fn summary(&self) -> HistogramSummary {
        let inner = self.inner.lock();
        if inner.recent.is_empty() {
            return HistogramSummary::default();
        }
        let mut sorted: Vec<f64> = inner.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let at = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)];
        HistogramSummary {
            count: inner.count,
            sum: inner.sum,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Summary statistics from a histogram. Quantiles cover the most recent
/// observations; count and sum cover all of them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }

    fn labels_json_with(&self, extra: Option<(&str, &str)>) -> Option<String> {
        if self.labels.is_empty() && extra.is_none() {
            return None;
        }
        let mut map: BTreeMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if let Some((k, v)) = extra {
            map.insert(k, v);
        }
        serde_json::to_string(&map).ok()
    }

    fn labels_json(&self) -> Option<String> {
        self.labels_json_with(None)
    }
}

/// Find-or-insert under a read lock first, upgrading only on first use.
fn with_metric<T>(
    map: &RwLock<HashMap<MetricKey, T>>,
    key: MetricKey,
    init: fn() -> T,
    f: impl FnOnce(&T),
) {
    {
        let read = map.read();
        if let Some(m) = read.get(&key) {
            f(m);
            return;
        }
    }
    let mut write = map.write();
    f(write.entry(key).or_insert_with(init));
}

fn read_metric<T, R>(
    map: &RwLock<HashMap<MetricKey, T>>,
    key: &MetricKey,
    f: impl FnOnce(&T) -> R,
) -> Option<R> {
    map.read().get(key).map(f)
}

/// Thread-safe metrics recorder backed by SQLite for historical snapshots.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Recorder whose snapshots go to a private in-memory database.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_metric(&self.counters, MetricKey::new(name, labels), Counter::new, |c| {
            c.increment(n)
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_metric(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| g.set(value));
    }

    /// Increment/decrement a gauge by delta.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        with_metric(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| {
            g.increment(delta)
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_metric(&self.histograms, MetricKey::new(name, labels), Histogram::new, |h| {
            h.observe(value)
        });
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        read_metric(&self.histograms, &MetricKey::new(name, labels), Histogram::summary)
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        read_metric(&self.counters, &MetricKey::new(name, labels), Counter::get).unwrap_or(0)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        read_metric(&self.gauges, &MetricKey::new(name, labels), Gauge::get).unwrap_or(0.0)
    }

    /// Persist every current value. Histograms become one row per quantile,
    /// tagged with a `quantile` label.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let mut rows: Vec<(String, f64, Option<String>, MetricType)> = Vec::new();

        for (key, counter) in self.counters.read().iter() {
            rows.push((key.name.clone(), counter.get() as f64, key.labels_json(), MetricType::Counter));
        }
        for (key, gauge) in self.gauges.read().iter() {
            rows.push((key.name.clone(), gauge.get(), key.labels_json(), MetricType::Gauge));
        }
        for (key, histogram) in self.histograms.read().iter() {
            let summary = histogram.summary();
            for (q, value) in [("0.5", summary.p50), ("0.95", summary.p95), ("0.99", summary.p99)] {
                rows.push((
                    key.name.clone(),
                    value,
                    key.labels_json_with(Some(("quantile", q))),
                    MetricType::Histogram,
                ));
            }
        }

        let mut db = self.db.lock();
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (name, value, labels, metric_type) in &rows {
                stmt.execute(rusqlite::params![now, name, value, labels, metric_type.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Query historical metric snapshots, newest first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let db = self.db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(name) = &q.name {
            sql.push_str(&format!(" AND name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }
        sql.push_str(" ORDER BY id DESC");
        // Label filtering happens after the fetch, so only cap rows here when
        // no label filter applies.
        if q.labels.is_none() {
            sql.push_str(&format!(" LIMIT {}", q.limit.unwrap_or(100)));
        }

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let mt: String = row.get(5)?;
            let metric_type = match mt.as_str() {
                "gauge" => MetricType::Gauge,
                "histogram" => MetricType::Histogram,
                _ => MetricType::Counter,
            };
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type,
            })
        })?;
        let mut out: Vec<MetricsSnapshot> = rows.collect::<Result<_, _>>()?;

        if let Some(wanted) = &q.labels {
            out.retain(|s| labels_match(s.labels.as_deref(), wanted));
            out.truncate(q.limit.unwrap_or(100) as usize);
        }
        Ok(out)
    }

    /// Delete snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let db = self.db.lock();
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        db.execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }
}

fn labels_match(labels: Option<&str>, wanted: &HashMap<String, String>) -> bool {
    let have: HashMap<String, String> = labels
        .and_then(|l| serde_json::from_str(l).ok())
        .unwrap_or_default();
    wanted.iter().all(|(k, v)| have.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bridge-test-metrics-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-metrics.db")
    }

    #[test]
    fn counters_are_keyed_by_labels() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc(names::CALLS_FINISHED, &[("status", "ok")], 1);
        recorder.counter_inc(names::CALLS_FINISHED, &[("status", "ok")], 1);
        recorder.counter_inc(names::CALLS_FINISHED, &[("status", "cancelled")], 1);

        assert_eq!(recorder.counter_get(names::CALLS_FINISHED, &[("status", "ok")]), 2);
        assert_eq!(recorder.counter_get(names::CALLS_FINISHED, &[("status", "cancelled")]), 1);
        assert_eq!(recorder.counter_get(names::CALLS_FINISHED, &[("status", "backend_error")]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc("x", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("x", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("x", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn gauge_tracks_sessions() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.gauge_inc(names::SESSIONS_ACTIVE, &[], 1.0);
        recorder.gauge_inc(names::SESSIONS_ACTIVE, &[], 1.0);
        recorder.gauge_inc(names::SESSIONS_ACTIVE, &[], -1.0);
        assert_eq!(recorder.gauge_get(names::SESSIONS_ACTIVE, &[]), 1.0);
        recorder.gauge_set(names::SESSIONS_ACTIVE, &[], 0.0);
        assert_eq!(recorder.gauge_get(names::SESSIONS_ACTIVE, &[]), 0.0);
    }

    #[test]
    fn histogram_summary() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        for v in 1..=100 {
            recorder.histogram_observe(names::CALL_DURATION_MS, &[], v as f64);
        }
        let s = recorder.histogram_summary(names::CALL_DURATION_MS, &[]);
        assert_eq!(s.count, 100);
        assert_eq!(s.sum, 5050.0);
        assert_eq!(s.p50, 51.0);
        assert_eq!(s.p99, 100.0);

        assert_eq!(recorder.histogram_summary("missing", &[]).count, 0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        for _ in 0..HISTOGRAM_RESERVOIR {
            recorder.histogram_observe("h", &[], 1000.0);
        }
        for _ in 0..HISTOGRAM_RESERVOIR {
            recorder.histogram_observe("h", &[], 1.0);
        }
        let s = recorder.histogram_summary("h", &[]);
        assert_eq!(s.count, 2 * HISTOGRAM_RESERVOIR as u64);
        // Old observations aged out of the quantile window.
        assert_eq!(s.p99, 1.0);
    }

    #[test]
    fn snapshot_and_query() {
        let recorder = MetricsRecorder::new(&temp_db()).unwrap();
        recorder.counter_inc(names::CALLS_OPENED, &[("method", "Echo/Say")], 3);
        recorder.gauge_set(names::SESSIONS_ACTIVE, &[], 2.0);
        recorder.histogram_observe(names::CALL_DURATION_MS, &[], 12.0);

        // counter + gauge + three histogram quantiles
        assert_eq!(recorder.snapshot().unwrap(), 5);

        let opened = recorder
            .query(&MetricsQuery {
                name: Some(names::CALLS_OPENED.into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].value, 3.0);
        assert_eq!(opened[0].metric_type, MetricType::Counter);
        assert_eq!(opened[0].labels.as_deref(), Some(r#"{"method":"Echo/Say"}"#));

        let p99 = recorder
            .query(&MetricsQuery {
                name: Some(names::CALL_DURATION_MS.into()),
                labels: Some(HashMap::from([("quantile".to_string(), "0.99".to_string())])),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(p99.len(), 1);
        assert_eq!(p99[0].metric_type, MetricType::Histogram);
    }

    #[test]
    fn query_since_and_prune() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc(names::DECODE_ERRORS, &[], 1);
        recorder.snapshot().unwrap();

        let future = recorder
            .query(&MetricsQuery {
                since: Some("2099-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());

        assert_eq!(recorder.prune(0).unwrap(), 1);
        assert!(recorder.query(&MetricsQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_increments() {
        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc(names::PROTOCOL_VIOLATIONS, &[("kind", "unknown_call")], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            recorder.counter_get(names::PROTOCOL_VIOLATIONS, &[("kind", "unknown_call")]),
            8000
        );
    }
}
