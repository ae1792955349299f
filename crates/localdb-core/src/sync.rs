//! Reconciles recorded instance status against live OS processes.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use localdb_store::{BackgroundWorker, EngineType, InstanceStatus};
use serde::Serialize;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    controller::ProcessController, probe::ProcessProbe, registry::InstanceRegistry, CoreError,
};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Instances found dead and marked stopped.
    pub corrected: Vec<Uuid>,
    /// Instances whose pid-file named a different live process.
    pub adopted: Vec<Uuid>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.corrected.is_empty() || !self.adopted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoStartFailure {
    pub instance_id: Uuid,
    pub engine_type: EngineType,
    pub error: String,
}

/// Result of the startup pass: reconciliation plus auto-start attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub reconcile: ReconcileReport,
    pub auto_started: Vec<Uuid>,
    pub failures: Vec<AutoStartFailure>,
}

pub struct StatusSynchronizer {
    registry: Arc<InstanceRegistry>,
    controller: Arc<ProcessController>,
    probe: Arc<dyn ProcessProbe>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl StatusSynchronizer {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        controller: Arc<ProcessController>,
        probe: Arc<dyn ProcessProbe>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            controller,
            probe,
            interval,
            shutdown,
        }
    }

    /// Marks running records whose process is gone as stopped. Publishes a
    /// snapshot only when something changed.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, CoreError> {
        let mut report = ReconcileReport::default();

        for instance in self.registry.list() {
            let (InstanceStatus::Running, Some(pid)) = (instance.status, instance.pid) else {
                continue;
            };
            if self.probe.is_alive(pid) {
                continue;
            }

            let adopted_pid = self
                .probe
                .read_pid_file(&instance.pid_file())
                .filter(|candidate| *candidate != pid && self.probe.is_alive(*candidate));
            if let Some(live_pid) = adopted_pid {
                if self
                    .registry
                    .set_status_if(instance.id, Some(pid), InstanceStatus::Running, Some(live_pid))
                    .await?
                    .is_some()
                {
                    info!(instance_id = %instance.id, old_pid = pid, pid = live_pid, "adopted pid from pid-file");
                    report.adopted.push(instance.id);
                }
                continue;
            }

            if self
                .registry
                .set_status_if(instance.id, Some(pid), InstanceStatus::Stopped, None)
                .await?
                .is_some()
            {
                info!(instance_id = %instance.id, engine = %instance.engine_type, pid, "process gone; marked stopped");
                report.corrected.push(instance.id);
            }
        }

        if report.changed() {
            self.registry.notify();
        } else {
            debug!("reconciliation found no changes");
        }
        Ok(report)
    }

    /// Reconciles leftovers from a previous run, then starts every stopped
    /// instance flagged for auto-start. Each start fails independently.
    #[instrument(skip(self))]
    pub async fn startup(&self) -> Result<StartupReport, CoreError> {
        let reconcile = self.reconcile().await?;
        let mut report = StartupReport {
            reconcile,
            ..Default::default()
        };

        for instance in self.registry.list() {
            if !instance.auto_start || instance.status != InstanceStatus::Stopped {
                continue;
            }
            match self.controller.start(instance.id).await {
                Ok(_) => report.auto_started.push(instance.id),
                Err(err) => {
                    warn!(instance_id = %instance.id, engine = %instance.engine_type, error = %err, "auto-start failed");
                    report.failures.push(AutoStartFailure {
                        instance_id: instance.id,
                        engine_type: instance.engine_type,
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl BackgroundWorker for StatusSynchronizer {
    async fn run(self: Arc<Self>) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Ok(());
        }
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; startup already reconciled.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "status reconciliation failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("status synchronizer stopped");
        Ok(())
    }
}
