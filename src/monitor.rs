/// Activity monitor: tracks completion of one campaign DAG.
///
/// The monitor owns its status table and talks to the rest of the agent only
/// through two queues: status reports and `KILL` come in on "to-monitor",
/// heartbeats go out on "to-status". The loop polls instead of blocking so
/// that completion, heartbeat cadence, diagnostics and message intake can be
/// serviced from one place. At most one inbound message is applied per tick.
use crate::config::MonitorConfig;
use crate::messages::{DagSeed, Heartbeat, MonitorMessage, StatusReport, MONITOR_ID, PROCESSING};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Activity id → status for the ids a DAG declared at seeding time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityStatusTable {
    entries: BTreeMap<String, String>,
}

impl ActivityStatusTable {
    /// Every declared id starts as `PROCESSING`; the `MONITOR` id is skipped.
    pub fn seed<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = ids
            .into_iter()
            .map(Into::into)
            .filter(|id| id != MONITOR_ID)
            .map(|id| (id, PROCESSING.to_string()))
            .collect();
        Self { entries }
    }

    /// Overwrite the entry for a tracked id. Returns false for unknown ids.
    pub fn apply(&mut self, report: &StatusReport) -> bool {
        match self.entries.get_mut(&report.activity_id) {
            Some(status) => {
                status.clone_from(&report.status);
                true
            }
            None => false,
        }
    }

    pub fn processing_count(&self) -> usize {
        self.entries.values().filter(|s| *s == PROCESSING).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for ActivityStatusTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (id, status)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}: {status}")?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Active,
    Completed,
}

/// Why the monitor reached `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// No tracked activity is `PROCESSING` anymore.
    Resolved,
    /// `KILL` arrived.
    Killed,
}

/// Timing knobs for the run loop.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub heartbeat_interval: Duration,
    pub diagnostics_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            diagnostics_interval: config.diagnostics_interval(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// What the monitor hands back once it stops.
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub campaign_id: String,
    pub completion: Completion,
    pub table: ActivityStatusTable,
}

pub struct ActivityMonitor {
    campaign_id: String,
    table: ActivityStatusTable,
    state: MonitorState,
    completion: Option<Completion>,
    settings: MonitorSettings,
    inbound: UnboundedReceiver<MonitorMessage>,
    outbound: UnboundedSender<Heartbeat>,
    last_heartbeat: Instant,
    last_diagnostics: Instant,
    last_logged_processing: Option<usize>,
}

impl ActivityMonitor {
    pub fn new(
        seed: &DagSeed,
        settings: MonitorSettings,
        inbound: UnboundedReceiver<MonitorMessage>,
        outbound: UnboundedSender<Heartbeat>,
    ) -> Self {
        let now = Instant::now();
        Self {
            campaign_id: seed.campaign_id.clone(),
            table: ActivityStatusTable::seed(seed.all_activity_ids.iter().cloned()),
            state: MonitorState::Active,
            completion: None,
            settings,
            inbound,
            outbound,
            last_heartbeat: now,
            last_diagnostics: now,
            last_logged_processing: None,
        }
    }

    /// One pass of the loop, minus the idle delay.
    pub fn tick(&mut self) -> MonitorState {
        if self.state == MonitorState::Completed {
            return self.state;
        }

        if self.table.processing_count() == 0 {
            self.complete(Completion::Resolved);
        }

        match self.inbound.try_recv() {
            Ok(MonitorMessage::Kill) => {
                tracing::info!(campaign_id = %self.campaign_id, "kill received, stopping monitor");
                self.complete(Completion::Killed);
                return self.state;
            }
            Ok(MonitorMessage::Report(report)) => {
                if self.table.apply(&report) {
                    tracing::debug!(
                        activity_id = %report.activity_id,
                        status = %report.status,
                        "activity status updated"
                    );
                } else {
                    tracing::debug!(
                        activity_id = %report.activity_id,
                        "status report for untracked activity ignored"
                    );
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        let now = Instant::now();
        self.log_diagnostics(now);

        if now.duration_since(self.last_heartbeat) > self.settings.heartbeat_interval {
            let processing = self.table.processing_count();
            let msg = format!(
                "{processing} of {} activities processing at {}",
                self.table.len(),
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
            );
            if self
                .outbound
                .send(Heartbeat::new(&self.campaign_id, msg))
                .is_err()
            {
                tracing::debug!("heartbeat queue closed");
            }
            self.last_heartbeat = now;
        }

        self.state
    }

    fn log_diagnostics(&mut self, now: Instant) {
        if now.duration_since(self.last_diagnostics) < self.settings.diagnostics_interval {
            return;
        }
        let processing = self.table.processing_count();
        if self.last_logged_processing == Some(processing) {
            return;
        }
        tracing::info!(
            campaign_id = %self.campaign_id,
            processing,
            table = %self.table,
            "activity snapshot"
        );
        self.last_logged_processing = Some(processing);
        self.last_diagnostics = now;
    }

    fn complete(&mut self, completion: Completion) {
        self.state = MonitorState::Completed;
        if self.completion.is_none() {
            self.completion = Some(completion);
        }
    }

    /// Poll until completed, sleeping `poll_interval` between ticks.
    pub async fn run(mut self) -> MonitorReport {
        tracing::info!(
            campaign_id = %self.campaign_id,
            activities = self.table.len(),
            "activity monitor started"
        );
        if self.table.is_empty() {
            tracing::warn!(campaign_id = %self.campaign_id, "campaign declares no activities");
        }

        while self.tick() == MonitorState::Active {
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        let completion = self.completion.unwrap_or(Completion::Resolved);
        tracing::info!(
            campaign_id = %self.campaign_id,
            ?completion,
            table = %self.table,
            "campaign monitoring completed"
        );

        MonitorReport {
            campaign_id: self.campaign_id,
            completion,
            table: self.table,
        }
    }
}

/// A monitor running on its own tokio task.
pub struct MonitorHandle {
    campaign_id: String,
    inbound: UnboundedSender<MonitorMessage>,
    task: JoinHandle<MonitorReport>,
}

impl MonitorHandle {
    /// Seed a monitor from `seed` and start its loop. Heartbeats go to `outbound`.
    pub fn spawn(
        seed: &DagSeed,
        settings: MonitorSettings,
        outbound: UnboundedSender<Heartbeat>,
    ) -> Self {
        let (inbound, rx) = mpsc::unbounded_channel();
        let monitor = ActivityMonitor::new(seed, settings, rx, outbound);
        Self {
            campaign_id: seed.campaign_id.clone(),
            inbound,
            task: tokio::spawn(monitor.run()),
        }
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    /// Queue a message for the monitor. Returns false once the monitor has stopped.
    pub fn send(&self, message: MonitorMessage) -> bool {
        self.inbound.send(message).is_ok()
    }

    pub fn kill(&self) -> bool {
        self.send(MonitorMessage::Kill)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<MonitorReport, JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(ids: &[&str]) -> DagSeed {
        DagSeed {
            campaign_id: "c1".to_string(),
            all_activity_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn monitor(
        ids: &[&str],
    ) -> (
        ActivityMonitor,
        UnboundedSender<MonitorMessage>,
        UnboundedReceiver<Heartbeat>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let m = ActivityMonitor::new(&seed(ids), MonitorSettings::default(), in_rx, out_tx);
        (m, in_tx, out_rx)
    }

    fn status_of<'a>(table: &'a ActivityStatusTable, id: &str) -> Option<&'a str> {
        table.entries.get(id).map(String::as_str)
    }

    fn report(id: &str, status: &str) -> MonitorMessage {
        MonitorMessage::Report(StatusReport::new(id, status))
    }

    #[test]
    fn test_table_seed_excludes_monitor() {
        let table = ActivityStatusTable::seed(["A", "B", "MONITOR"]);
        assert_eq!(table.len(), 2);
        assert_eq!(status_of(&table, "A"), Some("PROCESSING"));
        assert_eq!(status_of(&table, "B"), Some("PROCESSING"));
        assert_eq!(status_of(&table, "MONITOR"), None);
        assert_eq!(table.processing_count(), 2);
        assert_eq!(table.to_string(), "{A: PROCESSING, B: PROCESSING}");
    }

    #[test]
    fn test_table_apply_unknown_id_is_ignored() {
        let mut table = ActivityStatusTable::seed(["A"]);
        assert!(!table.apply(&StatusReport::new("Z", "DONE")));
        assert_eq!(table.len(), 1);
        assert_eq!(status_of(&table, "Z"), None);
        assert_eq!(table.processing_count(), 1);
    }

    #[test]
    fn test_table_terminal_status_can_be_overwritten() {
        let mut table = ActivityStatusTable::seed(["A"]);
        assert!(table.apply(&StatusReport::new("A", "DONE")));
        assert!(table.apply(&StatusReport::new("A", "FAILED")));
        assert_eq!(status_of(&table, "A"), Some("FAILED"));
        assert!(table.apply(&StatusReport::new("A", "PROCESSING")));
        assert_eq!(table.processing_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_two_reports_then_completed() {
        let (mut m, tx, _hb) = monitor(&["A", "B", "MONITOR"]);
        assert_eq!(m.table.to_string(), "{A: PROCESSING, B: PROCESSING}");

        tx.send(report("A", "DONE")).unwrap();
        assert_eq!(m.tick(), MonitorState::Active);
        tx.send(report("B", "DONE")).unwrap();
        assert_eq!(m.tick(), MonitorState::Active);

        // The completion check runs before intake, so it lands on the next tick.
        assert_eq!(m.tick(), MonitorState::Completed);
        assert_eq!(m.completion, Some(Completion::Resolved));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_independent_of_report_order() {
        for order in [["A", "B"], ["B", "A"]] {
            let (mut m, tx, _hb) = monitor(&["A", "B"]);
            for id in order {
                tx.send(report(id, "FAILED")).unwrap();
                m.tick();
            }
            assert_eq!(m.tick(), MonitorState::Completed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_message_per_tick() {
        let (mut m, tx, _hb) = monitor(&["A", "B"]);
        tx.send(report("A", "DONE")).unwrap();
        tx.send(report("B", "DONE")).unwrap();

        m.tick();
        assert_eq!(status_of(&m.table, "A"), Some("DONE"));
        assert_eq!(status_of(&m.table, "B"), Some("PROCESSING"));
        m.tick();
        assert_eq!(status_of(&m.table, "B"), Some("DONE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_overrides_processing() {
        let (mut m, tx, _hb) = monitor(&["A", "B"]);
        tx.send(MonitorMessage::Kill).unwrap();

        assert_eq!(m.tick(), MonitorState::Completed);
        assert_eq!(m.completion, Some(Completion::Killed));
        assert_eq!(m.table.processing_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_report_does_not_complete() {
        let (mut m, tx, _hb) = monitor(&["A"]);
        tx.send(report("ghost", "DONE")).unwrap();
        m.tick();
        assert_eq!(m.tick(), MonitorState::Active);
        assert_eq!(m.table.len(), 1);
        assert_eq!(m.table.processing_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_dag_completes_immediately() {
        let (mut m, _tx, _hb) = monitor(&["MONITOR"]);
        assert!(m.table.is_empty());
        assert_eq!(m.tick(), MonitorState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence() {
        let (mut m, _tx, mut hb) = monitor(&["A"]);

        m.tick();
        tokio::time::advance(Duration::from_millis(4_900)).await;
        m.tick();
        assert!(hb.try_recv().is_err(), "no heartbeat before the window");

        tokio::time::advance(Duration::from_millis(200)).await;
        m.tick();
        let beat = hb.try_recv().unwrap();
        assert_eq!(beat.status, "MONITORING");
        assert_eq!(beat.activity_id, "MONITOR");
        assert_eq!(beat.campaign_id, "c1");
        assert!(beat.msg.starts_with("1 of 1 activities processing"));

        m.tick();
        tokio::time::advance(Duration::from_millis(4_000)).await;
        m.tick();
        assert!(hb.try_recv().is_err(), "at most one heartbeat per window");
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostics_only_on_changed_count_after_interval() {
        let (mut m, tx, _hb) = monitor(&["A", "B"]);
        let started = m.last_diagnostics;

        m.tick();
        assert_eq!(m.last_logged_processing, None);
        assert_eq!(m.last_diagnostics, started);

        tokio::time::advance(Duration::from_secs(10)).await;
        m.tick();
        let first_snapshot = Instant::now();
        assert_eq!(m.last_logged_processing, Some(2));
        assert_eq!(m.last_diagnostics, first_snapshot);

        // Interval elapsed again but nothing changed.
        tokio::time::advance(Duration::from_secs(10)).await;
        m.tick();
        assert_eq!(m.last_logged_processing, Some(2));
        assert_eq!(m.last_diagnostics, first_snapshot);

        tokio::time::advance(Duration::from_secs(5)).await;
        tx.send(report("A", "DONE")).unwrap();
        m.tick();
        let second_snapshot = Instant::now();
        assert_eq!(m.last_logged_processing, Some(1));
        assert_eq!(m.last_diagnostics, second_snapshot);

        // Count changed but the interval has not elapsed since the last snapshot.
        tokio::time::advance(Duration::from_secs(5)).await;
        tx.send(report("B", "DONE")).unwrap();
        m.tick();
        assert_eq!(m.table.processing_count(), 0);
        assert_eq!(m.last_logged_processing, Some(1));
        assert_eq!(m.last_diagnostics, second_snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_heartbeat_queue_is_harmless() {
        let (mut m, _tx, hb) = monitor(&["A"]);
        drop(hb);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(m.tick(), MonitorState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_emits_heartbeats_until_killed() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = MonitorHandle::spawn(&seed(&["A", "B"]), MonitorSettings::default(), out_tx);
        assert_eq!(handle.campaign_id(), "c1");

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!handle.is_finished());
        assert!(handle.kill());

        let report = handle.join().await.unwrap();
        assert_eq!(report.completion, Completion::Killed);

        let mut beats = 0;
        while out_rx.try_recv().is_ok() {
            beats += 1;
        }
        assert_eq!(beats, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_resolves_on_reports() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let handle = MonitorHandle::spawn(
            &seed(&["A", "B", "MONITOR"]),
            MonitorSettings::default(),
            out_tx,
        );

        assert!(handle.send(report("B", "DONE")));
        assert!(handle.send(report("unknown", "DONE")));
        assert!(handle.send(report("A", "FAILED")));

        let report = handle.join().await.unwrap();
        assert_eq!(report.campaign_id, "c1");
        assert_eq!(report.completion, Completion::Resolved);
        assert_eq!(status_of(&report.table, "A"), Some("FAILED"));
        assert_eq!(status_of(&report.table, "B"), Some("DONE"));
        assert_eq!(report.table.len(), 2);
    }
}
