/// The agent process itself: what `start` launches in the background.
///
/// Binds the activity and heartbeat ports, waits for a campaign DAG, runs an
/// activity monitor for it and routes status reports and `KILL` into the
/// monitor. One campaign is monitored at a time; when it completes the agent
/// waits for the next DAG. The agent runs until it is killed.
use crate::config::AgentConfig;
use crate::messages::{Heartbeat, InboundMessage};
use crate::monitor::{MonitorHandle, MonitorReport, MonitorSettings};
use crate::transport::{self, TransportError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Values `start` passes on the agent's command line.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub log_path: String,
    pub debug: bool,
    pub heartbeat_port: u16,
    pub activity_port: u16,
}

/// Routes inbound messages to the current campaign's monitor.
pub struct Agent {
    settings: MonitorSettings,
    status_tx: mpsc::UnboundedSender<Heartbeat>,
    current: Option<MonitorHandle>,
}

impl Agent {
    pub fn new(settings: MonitorSettings, status_tx: mpsc::UnboundedSender<Heartbeat>) -> Self {
        Self {
            settings,
            status_tx,
            current: None,
        }
    }

    /// Campaign currently being monitored, if its monitor is still running.
    pub fn active_campaign(&self) -> Option<&str> {
        self.current
            .as_ref()
            .filter(|h| !h.is_finished())
            .map(MonitorHandle::campaign_id)
    }

    pub async fn dispatch(&mut self, message: InboundMessage) {
        self.reap().await;

        match message {
            InboundMessage::Dag(seed) => {
                if let Some(active) = self.active_campaign() {
                    tracing::warn!(
                        active = %active,
                        rejected = %seed.campaign_id,
                        "a campaign is already being monitored, DAG ignored"
                    );
                    return;
                }
                tracing::info!(
                    campaign_id = %seed.campaign_id,
                    activities = seed.all_activity_ids.len(),
                    "monitoring new campaign"
                );
                self.current = Some(MonitorHandle::spawn(
                    &seed,
                    self.settings,
                    self.status_tx.clone(),
                ));
            }
            other => {
                let Some(message) = other.into_monitor_message() else {
                    return;
                };
                let delivered = self
                    .current
                    .as_ref()
                    .is_some_and(|handle| handle.send(message.clone()));
                if !delivered {
                    tracing::debug!(?message, "no campaign is being monitored, message dropped");
                }
            }
        }
    }

    /// Collect the report of a monitor that has finished.
    pub async fn reap(&mut self) -> Option<MonitorReport> {
        if !self.current.as_ref().is_some_and(MonitorHandle::is_finished) {
            return None;
        }
        let handle = self.current.take()?;
        match handle.join().await {
            Ok(report) => {
                tracing::info!(
                    campaign_id = %report.campaign_id,
                    completion = ?report.completion,
                    "campaign finished"
                );
                Some(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "activity monitor task failed");
                None
            }
        }
    }

    /// Kill the current monitor, if any, and wait for it.
    pub async fn shutdown(&mut self) -> Option<MonitorReport> {
        let handle = self.current.take()?;
        handle.kill();
        handle.join().await.ok()
    }
}

/// Run the agent until interrupted.
pub async fn run_agent(config: &AgentConfig, args: &RunArgs) -> Result<(), TransportError> {
    let host = config.ports.bind_host.as_str();
    let activity = transport::bind(host, args.activity_port).await?;
    let heartbeat = transport::bind(host, args.heartbeat_port).await?;

    tracing::info!(
        pid = std::process::id(),
        log_path = %args.log_path,
        heartbeat_port = args.heartbeat_port,
        activity_port = args.activity_port,
        "agent listening"
    );

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<Heartbeat>();
    let (beats, _) = broadcast::channel(64);

    tokio::spawn(transport::serve_activity(activity, inbound_tx));
    tokio::spawn(transport::serve_heartbeats(heartbeat, beats.clone()));
    tokio::spawn(async move {
        while let Some(beat) = status_rx.recv().await {
            tracing::debug!(campaign_id = %beat.campaign_id, msg = %beat.msg, "heartbeat");
            // No subscribers is fine.
            let _ = beats.send(beat);
        }
    });

    let mut agent = Agent::new(MonitorSettings::from(&config.monitor), status_tx);
    let mut reap_interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            message = inbound_rx.recv() => match message {
                Some(message) => agent.dispatch(message).await,
                None => break,
            },
            _ = reap_interval.tick() => {
                agent.reap().await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
        }
    }

    agent.shutdown().await;
    tracing::info!("agent exiting");
    Ok(())
}
