//! Health conditions, evaluated without side effects.
//!
//! The monitor feeds observations in and gets back whether each condition
//! holds. [`Edge`] turns those booleans into raise/clear signals that fire
//! only when the condition flips.

use std::time::{Duration, Instant};

use chainward_core::config::HealthConfig;
use chainward_placement::HostResources;
use chainward_state::{AlertSeverity, AlertType, NodeStatus};

/// What to do with the alert behind a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Raise,
    Clear,
}

/// Last reported value of one condition.
///
/// The first observation always produces a signal, so alerts left open by
/// a previous run get resolved if the condition no longer holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Edge(Option<bool>);

impl Edge {
    pub fn update(&mut self, active: bool) -> Option<Signal> {
        if self.0 == Some(active) {
            return None;
        }
        self.0 = Some(active);
        Some(if active { Signal::Raise } else { Signal::Clear })
    }

    /// Forget the last value; the next update signals again.
    pub fn reset(&mut self) {
        self.0 = None;
    }
}

/// One host-level figure compared against its limit.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemReading {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub label: &'static str,
    pub value: f64,
    pub limit: f64,
}

impl SystemReading {
    pub fn over_limit(&self) -> bool {
        self.value > self.limit
    }

    pub fn message(&self) -> String {
        format!(
            "{} usage at {:.1}% exceeds limit of {:.1}%",
            self.label, self.value, self.limit
        )
    }
}

/// CPU, memory and disk readings for the host.
pub fn system_readings(host: &HostResources, config: &HealthConfig) -> [SystemReading; 3] {
    [
        SystemReading {
            alert_type: AlertType::CpuHigh,
            severity: AlertSeverity::Warning,
            label: "CPU",
            value: host.cpu_percent,
            limit: config.cpu_limit_percent,
        },
        SystemReading {
            alert_type: AlertType::MemoryCritical,
            severity: AlertSeverity::Critical,
            label: "memory",
            value: host.memory_used_percent(),
            limit: config.memory_limit_percent,
        },
        SystemReading {
            alert_type: AlertType::DiskFull,
            severity: AlertSeverity::Critical,
            label: "disk",
            value: host.disk_used_percent(),
            limit: config.disk_limit_percent,
        },
    ]
}

/// Liveness and stall bookkeeping for one node.
#[derive(Debug, Clone)]
pub struct NodeWatch {
    down_since: Option<Instant>,
    progress: f64,
    progress_since: Instant,
    pub down: Edge,
    pub stall: Edge,
}

impl NodeWatch {
    pub fn new(now: Instant) -> Self {
        Self {
            down_since: None,
            progress: 0.0,
            progress_since: now,
            down: Edge::default(),
            stall: Edge::default(),
        }
    }

    /// A node is down once it has been stopped or errored for longer than
    /// `grace`.
    pub fn is_down(&mut self, status: NodeStatus, now: Instant, grace: Duration) -> bool {
        if !matches!(status, NodeStatus::Stopped | NodeStatus::Error) {
            self.down_since = None;
            return false;
        }
        let since = *self.down_since.get_or_insert(now);
        now.saturating_duration_since(since) >= grace
    }

    /// A syncing node is stalled once its progress has not moved for longer
    /// than `window`. Any change restarts the clock.
    pub fn is_stalled(
        &mut self,
        status: NodeStatus,
        progress: f64,
        now: Instant,
        window: Duration,
    ) -> bool {
        let moved = (progress - self.progress).abs() > f64::EPSILON;
        if status != NodeStatus::Syncing || moved {
            self.progress = progress;
            self.progress_since = now;
            return false;
        }
        now.saturating_duration_since(self.progress_since) > window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn edge_signals_only_on_change() {
        let mut edge = Edge::default();
        assert_eq!(edge.update(false), Some(Signal::Clear));
        assert_eq!(edge.update(false), None);
        assert_eq!(edge.update(true), Some(Signal::Raise));
        assert_eq!(edge.update(true), None);
        assert_eq!(edge.update(false), Some(Signal::Clear));

        edge.reset();
        assert_eq!(edge.update(false), Some(Signal::Clear));
    }

    #[test]
    fn readings_compare_against_limits() {
        let host = HostResources {
            disk_total_gb: 100.0,
            disk_available_gb: 5.0,
            memory_total_gb: 16.0,
            memory_available_gb: 8.0,
            cpu_percent: 40.0,
        };
        let readings = system_readings(&host, &HealthConfig::default());

        assert_eq!(readings[0].alert_type, AlertType::CpuHigh);
        assert!(!readings[0].over_limit());
        assert!(!readings[1].over_limit());
        assert!(readings[2].over_limit());
        assert_eq!(readings[2].severity, AlertSeverity::Critical);
        assert_eq!(
            readings[2].message(),
            "disk usage at 95.0% exceeds limit of 90.0%"
        );
    }

    #[test]
    fn down_after_grace_and_back_up() {
        let t0 = Instant::now();
        let mut watch = NodeWatch::new(t0);

        assert!(!watch.is_down(NodeStatus::Error, t0, secs(60)));
        assert!(!watch.is_down(NodeStatus::Error, t0 + secs(30), secs(60)));
        assert!(watch.is_down(NodeStatus::Error, t0 + secs(60), secs(60)));

        assert!(!watch.is_down(NodeStatus::Starting, t0 + secs(61), secs(60)));
        // The grace window restarts after recovery.
        assert!(!watch.is_down(NodeStatus::Stopped, t0 + secs(70), secs(60)));
        assert!(watch.is_down(NodeStatus::Stopped, t0 + secs(130), secs(60)));
    }

    #[test]
    fn stall_needs_flat_progress_past_window() {
        let t0 = Instant::now();
        let mut watch = NodeWatch::new(t0);
        let window = secs(3);

        assert!(!watch.is_stalled(NodeStatus::Syncing, 12.5, t0, window));
        assert!(!watch.is_stalled(NodeStatus::Syncing, 12.5, t0 + secs(3), window));
        assert!(watch.is_stalled(NodeStatus::Syncing, 12.5, t0 + secs(4), window));

        // Movement resets the clock.
        assert!(!watch.is_stalled(NodeStatus::Syncing, 12.6, t0 + secs(5), window));
        assert!(!watch.is_stalled(NodeStatus::Syncing, 12.6, t0 + secs(8), window));
        assert!(watch.is_stalled(NodeStatus::Syncing, 12.6, t0 + secs(9), window));
    }

    #[test]
    fn only_syncing_nodes_stall() {
        let t0 = Instant::now();
        let mut watch = NodeWatch::new(t0);
        assert!(!watch.is_stalled(NodeStatus::Ready, 100.0, t0, secs(1)));
        assert!(!watch.is_stalled(NodeStatus::Ready, 100.0, t0 + secs(10), secs(1)));
        // Entering syncing starts a fresh window.
        assert!(!watch.is_stalled(NodeStatus::Syncing, 100.0, t0 + secs(11), secs(1)));
        assert!(watch.is_stalled(NodeStatus::Syncing, 100.0, t0 + secs(13), secs(1)));
    }
}
