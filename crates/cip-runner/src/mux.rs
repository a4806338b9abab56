//! Fan-in of role output.
//!
//! Every role stream is pumped by one task that records the lines for
//! `stdout.log`, optionally tees them to a readiness tap, and forwards them to
//! the run's merged output. Lines travel an unbounded lane and are never
//! dropped. `STATS key=value ...` lines also feed an aggregator that publishes
//! snapshots at most once per interval over a bounded broadcast lane where a
//! slow reader loses the oldest snapshots.

use chrono::{DateTime, SecondsFormat, Utc};
use cip_core::Role;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub const STATS_PREFIX: &str = "STATS";
const STATS_LANE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputEvent {
    pub role: Role,
    pub stream: StreamKind,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputEvent {
    pub fn new(role: Role, stream: StreamKind, line: impl Into<String>) -> Self {
        Self {
            role,
            stream,
            line: line.into(),
            timestamp: Utc::now(),
        }
    }

    /// The line as written to `stdout.log`.
    pub fn log_line(&self) -> String {
        format!(
            "{} [{}] {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.stream,
            self.line
        )
    }
}

/// Parses `STATS key=value ...`. Non-numeric values are ignored; a line with
/// no numeric value is not a stats line.
pub fn parse_stats_line(line: &str) -> Option<BTreeMap<String, f64>> {
    let mut parts = line.split_whitespace();
    if parts.next()? != STATS_PREFIX {
        return None;
    }
    let values: BTreeMap<String, f64> = parts
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value = value.parse::<f64>().ok().filter(|v| v.is_finite())?;
            (!key.is_empty()).then(|| (key.to_string(), value))
        })
        .collect();
    (!values.is_empty()).then_some(values)
}

/// Latest counters reported by one role. Values are taken as reported, so a
/// role printing cumulative totals yields its final totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleStats {
    pub requests: u64,
    pub errors: u64,
    pub values: BTreeMap<String, f64>,
    pub samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RoleStats {
    fn apply(&mut self, values: &BTreeMap<String, f64>, at: DateTime<Utc>) {
        for (key, value) in values {
            match key.as_str() {
                "requests" => self.requests = value.max(0.0) as u64,
                "errors" => self.errors = value.max(0.0) as u64,
                _ => {
                    self.values.insert(key.clone(), *value);
                }
            }
        }
        self.samples += 1;
        self.updated_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub at: DateTime<Utc>,
    pub roles: BTreeMap<Role, RoleStats>,
}

/// Everything one role printed, kept for its bundle artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleCapture {
    pub role: Role,
    pub log: String,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
    pub stats: RoleStats,
}

impl RoleCapture {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            log: String::new(),
            stdout_lines: 0,
            stderr_lines: 0,
            first_at: None,
            last_at: None,
            stats: RoleStats::default(),
        }
    }

    fn record(&mut self, event: &OutputEvent) {
        self.log.push_str(&event.log_line());
        match event.stream {
            StreamKind::Stdout => self.stdout_lines += 1,
            StreamKind::Stderr => self.stderr_lines += 1,
        }
        self.first_at.get_or_insert(event.timestamp);
        self.last_at = Some(event.timestamp);
    }

    pub fn lines(&self) -> u64 {
        self.stdout_lines + self.stderr_lines
    }

    pub fn metrics_json(&self) -> Value {
        json!({
            "role": self.role.as_str(),
            "requests": self.stats.requests,
            "errors": self.stats.errors,
            "values": self.stats.values,
            "stats_samples": self.stats.samples,
            "stdout_lines": self.stdout_lines,
            "stderr_lines": self.stderr_lines,
            "first_line_at": self.first_at.map(|t| t.to_rfc3339()),
            "last_line_at": self.last_at.map(|t| t.to_rfc3339()),
        })
    }
}

/// Fan-in of any number of streams into one, preserving order within each.
pub fn merge(
    streams: Vec<mpsc::UnboundedReceiver<OutputEvent>>,
) -> mpsc::UnboundedReceiver<OutputEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for mut stream in streams {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
    }
    rx
}

#[derive(Debug, Clone, PartialEq)]
pub enum MuxEvent {
    Line(OutputEvent),
    Stats(StatsSnapshot),
}

/// Consumer side of one run's output.
pub struct RunOutput {
    lines: mpsc::UnboundedReceiver<OutputEvent>,
    stats: broadcast::Receiver<StatsSnapshot>,
    lines_open: bool,
    stats_open: bool,
}

impl RunOutput {
    /// Next line or stats snapshot; `None` once the run has finished and both
    /// lanes are drained.
    pub async fn recv(&mut self) -> Option<MuxEvent> {
        loop {
            tokio::select! {
                biased;
                line = self.lines.recv(), if self.lines_open => match line {
                    Some(event) => return Some(MuxEvent::Line(event)),
                    None => self.lines_open = false,
                },
                snapshot = self.stats.recv(), if self.stats_open => match snapshot {
                    Ok(snapshot) => return Some(MuxEvent::Stats(snapshot)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => self.stats_open = false,
                },
                else => return None,
            }
        }
    }
}

type StatsUpdate = (Role, BTreeMap<String, f64>, DateTime<Utc>);

pub struct Multiplexer {
    lines_tx: mpsc::UnboundedSender<OutputEvent>,
    stats_tx: mpsc::UnboundedSender<StatsUpdate>,
    stats_rx: Option<mpsc::UnboundedReceiver<StatsUpdate>>,
    snapshots: broadcast::Sender<StatsSnapshot>,
    stats_interval: Duration,
    verbose: bool,
}

impl Multiplexer {
    /// Creates the run's lanes. No task is spawned until the first `attach`.
    pub fn new(stats_interval: Duration, verbose: bool) -> (Self, RunOutput) {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshots_rx) = broadcast::channel(STATS_LANE_CAPACITY);
        let mux = Self {
            lines_tx,
            stats_tx,
            stats_rx: Some(stats_rx),
            snapshots,
            stats_interval,
            verbose,
        };
        let output = RunOutput {
            lines: lines_rx,
            stats: snapshots_rx,
            lines_open: true,
            stats_open: true,
        };
        (mux, output)
    }

    /// Pumps `events` until the role's stream closes and yields what was captured.
    pub fn attach(
        &mut self,
        role: Role,
        mut events: mpsc::UnboundedReceiver<OutputEvent>,
        tap: Option<mpsc::UnboundedSender<OutputEvent>>,
    ) -> JoinHandle<RoleCapture> {
        self.ensure_aggregator();
        let lines_tx = self.lines_tx.clone();
        let stats_tx = self.stats_tx.clone();
        let verbose = self.verbose;
        let mut tap = tap;
        tokio::spawn(async move {
            let mut capture = RoleCapture::new(role);
            while let Some(event) = events.recv().await {
                if verbose {
                    tracing::debug!(role = %role, stream = %event.stream, "{}", event.line);
                }
                capture.record(&event);
                if let Some(values) = parse_stats_line(&event.line) {
                    capture.stats.apply(&values, event.timestamp);
                    // The aggregator outlives every pump; a send failure means the run is over.
                    let _ = stats_tx.send((role, values, event.timestamp));
                }
                if let Some(sender) = &tap {
                    if sender.send(event.clone()).is_err() {
                        tap = None;
                    }
                }
                // The consumer may never have claimed the output.
                let _ = lines_tx.send(event);
            }
            capture
        })
    }

    fn ensure_aggregator(&mut self) {
        let Some(mut updates) = self.stats_rx.take() else {
            return;
        };
        let snapshots = self.snapshots.clone();
        let interval = self.stats_interval;
        tokio::spawn(async move {
            let mut roles: BTreeMap<Role, RoleStats> = BTreeMap::new();
            let mut dirty = false;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some((role, values, at)) => {
                            roles.entry(role).or_default().apply(&values, at);
                            dirty = true;
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if dirty {
                            publish(&snapshots, &roles);
                            dirty = false;
                        }
                    }
                }
            }
            if dirty {
                publish(&snapshots, &roles);
            }
        });
    }
}

fn publish(snapshots: &broadcast::Sender<StatsSnapshot>, roles: &BTreeMap<Role, RoleStats>) {
    let snapshot = StatsSnapshot {
        at: Utc::now(),
        roles: roles.clone(),
    };
    if snapshots.send(snapshot).is_err() {
        tracing::trace!("no stats subscribers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_lines_parse_numeric_pairs_only() {
        let values = parse_stats_line("STATS requests=12 errors=1 latency_ms=3.5 note=ok")
            .expect("stats line");
        assert_eq!(values.get("requests"), Some(&12.0));
        assert_eq!(values.get("errors"), Some(&1.0));
        assert_eq!(values.get("latency_ms"), Some(&3.5));
        assert!(!values.contains_key("note"));

        assert!(parse_stats_line("requests=12").is_none());
        assert!(parse_stats_line("STATS").is_none());
        assert!(parse_stats_line("STATS note=ok").is_none());
        assert!(parse_stats_line("STATISTICS requests=1").is_none());
    }

    #[tokio::test]
    async fn merge_preserves_per_stream_order() {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        for i in 0..50 {
            a_tx.send(OutputEvent::new(Role::Server, StreamKind::Stdout, format!("{}", i)))
                .expect("send a");
            b_tx.send(OutputEvent::new(Role::Client, StreamKind::Stdout, format!("{}", i)))
                .expect("send b");
        }
        drop(a_tx);
        drop(b_tx);

        let mut merged = merge(vec![a_rx, b_rx]);
        let mut server = Vec::new();
        let mut client = Vec::new();
        while let Some(event) = merged.recv().await {
            let n: u32 = event.line.parse().expect("number");
            match event.role {
                Role::Server => server.push(n),
                Role::Client => client.push(n),
            }
        }
        let expected: Vec<u32> = (0..50).collect();
        assert_eq!(server, expected);
        assert_eq!(client, expected);
    }

    #[tokio::test]
    async fn attach_captures_tees_and_publishes_stats() {
        let (mut mux, mut output) = Multiplexer::new(Duration::from_millis(20), false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
        let handle = mux.attach(Role::Client, events_rx, Some(tap_tx));

        events_tx
            .send(OutputEvent::new(Role::Client, StreamKind::Stdout, "hello"))
            .expect("send");
        events_tx
            .send(OutputEvent::new(Role::Client, StreamKind::Stdout, "STATS requests=4 errors=1"))
            .expect("send");
        events_tx
            .send(OutputEvent::new(Role::Client, StreamKind::Stderr, "warning"))
            .expect("send");
        drop(events_tx);

        let capture = handle.await.expect("pump");
        drop(mux);

        assert_eq!(capture.stdout_lines, 2);
        assert_eq!(capture.stderr_lines, 1);
        assert_eq!(capture.stats.requests, 4);
        assert_eq!(capture.stats.errors, 1);
        assert!(capture.log.contains("[stdout] hello\n"));
        assert!(capture.log.contains("[stderr] warning\n"));
        assert_eq!(capture.metrics_json()["requests"], 4);

        assert_eq!(tap_rx.recv().await.expect("tap").line, "hello");

        let mut lines = Vec::new();
        let mut last_stats = None;
        while let Some(event) = output.recv().await {
            match event {
                MuxEvent::Line(event) => lines.push(event.line),
                MuxEvent::Stats(snapshot) => last_stats = Some(snapshot),
            }
        }
        assert_eq!(lines, vec!["hello", "STATS requests=4 errors=1", "warning"]);
        let snapshot = last_stats.expect("stats snapshot published");
        assert_eq!(snapshot.roles.get(&Role::Client).map(|s| s.requests), Some(4));
    }

    #[tokio::test]
    async fn stalled_consumer_loses_old_snapshots_but_no_lines() {
        let (mut mux, mut output) = Multiplexer::new(Duration::from_millis(1), false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = mux.attach(Role::Client, events_rx, None);

        let reports = (STATS_LANE_CAPACITY * 4) as u64;
        for n in 1..=reports {
            events_tx
                .send(OutputEvent::new(
                    Role::Client,
                    StreamKind::Stdout,
                    format!("STATS requests={}", n),
                ))
                .expect("send");
            // Long enough for the aggregator to publish each report separately.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(events_tx);

        // Nothing has been read from `output`; the pump must still finish.
        let capture = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pump never blocks on the consumer")
            .expect("pump");
        assert_eq!(capture.stats.requests, reports);
        drop(mux);

        let mut lines = Vec::new();
        let mut snapshots = Vec::new();
        while let Some(event) = output.recv().await {
            match event {
                MuxEvent::Line(event) => lines.push(event.line),
                MuxEvent::Stats(snapshot) => snapshots.push(
                    snapshot
                        .roles
                        .get(&Role::Client)
                        .map(|s| s.requests)
                        .unwrap_or_default(),
                ),
            }
        }
        let expected: Vec<String> = (1..=reports).map(|n| format!("STATS requests={}", n)).collect();
        assert_eq!(lines, expected);
        assert!(!snapshots.is_empty());
        assert!(snapshots.len() <= STATS_LANE_CAPACITY, "{:?}", snapshots);
        assert!(snapshots[0] > 1, "oldest snapshots are dropped: {:?}", snapshots);
        assert_eq!(snapshots.last(), Some(&reports));
        assert!(snapshots.windows(2).all(|w| w[0] <= w[1]));
    }
}
