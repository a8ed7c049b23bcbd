use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::backend::WorkflowBackend;
use crate::domain::module::Module;
use crate::domain::session::Session;
use crate::errors::ApplicationError;
use crate::sla::{overdue_alerts, SlaAlert};

#[derive(Clone, Debug, Default)]
struct SlaState {
    alerts: Vec<SlaAlert>,
    last_checked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Checked { alerts: usize },
    SkippedInFlight,
    Failed(String),
}

/// Polls one tenant's open requests for missed deadlines.
pub struct SlaMonitor<B> {
    backend: Arc<B>,
    session: Session,
    critical_overdue_hours: i64,
    in_flight: AtomicBool,
    completed: Notify,
    last_queried_at: RwLock<DateTime<Utc>>,
    state: RwLock<SlaState>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B> SlaMonitor<B>
where
    B: WorkflowBackend + 'static,
{
    pub fn new(backend: Arc<B>, session: Session, critical_overdue_hours: i64) -> Self {
        Self {
            backend,
            session,
            critical_overdue_hours,
            in_flight: AtomicBool::new(false),
            completed: Notify::new(),
            last_queried_at: RwLock::new(Utc::now()),
            state: RwLock::new(SlaState::default()),
        }
    }

    pub async fn check_sla_violations(&self) -> Result<Vec<SlaAlert>, ApplicationError> {
        self.check_sla_violations_at(Utc::now()).await
    }

    /// Re-reads open requests and replaces the cached alert list.
    pub async fn check_sla_violations_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SlaAlert>, ApplicationError> {
        let session = self.session.require()?;

        let result = self.backend.list_open_with_due(&session.tenant_id).await;
        let mut state = self.write_state();
        state.last_checked_at = Some(now);
        match result {
            Ok(requests) => {
                let alerts = overdue_alerts(&requests, now);
                state.alerts = alerts.clone();
                state.last_error = None;
                Ok(alerts)
            }
            Err(error) => {
                state.last_error = Some(format!("Failed to check SLA violations: {error}"));
                Err(error)
            }
        }
    }

    /// One polling step. Skips instead of overlapping a check already in flight.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                event_name = "sla.monitor.tick_skipped",
                tenant_id = self.tenant_label(),
                "previous SLA check still running; skipping tick"
            );
            return TickOutcome::SkippedInFlight;
        }
        let guard = InFlightGuard(&self.in_flight);

        let outcome = match self.check_sla_violations().await {
            Ok(alerts) => {
                let critical =
                    alerts.iter().filter(|alert| alert.is_critical(self.critical_overdue_hours)).count();
                info!(
                    event_name = "sla.monitor.checked",
                    tenant_id = self.tenant_label(),
                    overdue = alerts.len(),
                    critical = critical,
                    "SLA check completed"
                );
                TickOutcome::Checked { alerts: alerts.len() }
            }
            Err(error) => {
                warn!(
                    event_name = "sla.monitor.check_failed",
                    tenant_id = self.tenant_label(),
                    error = %error,
                    "SLA check failed"
                );
                TickOutcome::Failed(error.to_string())
            }
        };
        drop(guard);
        self.completed.notify_waiters();
        outcome
    }

    /// Returns once at least one check has completed.
    ///
    /// Runs the check here unless another one is in flight, in which case it
    /// waits for that one instead of starting a second fetch. Fails with the
    /// check's error when the check it ran or waited on failed.
    pub async fn ensure_checked(&self) -> Result<(), String> {
        if self.last_checked_at().is_some() {
            return Ok(());
        }
        loop {
            let mut completed = std::pin::pin!(self.completed.notified());
            completed.as_mut().enable();
            match self.tick().await {
                TickOutcome::Checked { .. } => return Ok(()),
                TickOutcome::Failed(error) => return Err(error),
                TickOutcome::SkippedInFlight => {
                    completed.await;
                    if self.last_checked_at().is_some() {
                        return self.last_error().map_or(Ok(()), Err);
                    }
                }
            }
        }
    }

    /// Records that a caller read this monitor's alerts.
    pub fn touch(&self) {
        let mut last = match self.last_queried_at.write() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Utc::now();
    }

    pub fn last_queried_at(&self) -> DateTime<Utc> {
        match self.last_queried_at.read() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_checking(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn alerts(&self) -> Vec<SlaAlert> {
        self.read_state().alerts.clone()
    }

    /// Critical priority, or more than the configured hours late.
    pub fn critical_alerts(&self) -> Vec<SlaAlert> {
        self.read_state()
            .alerts
            .iter()
            .filter(|alert| alert.is_critical(self.critical_overdue_hours))
            .cloned()
            .collect()
    }

    pub fn alerts_by_module(&self, module: Module) -> Vec<SlaAlert> {
        self.read_state().alerts.iter().filter(|alert| alert.module == module).cloned().collect()
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.read_state().last_checked_at
    }

    pub fn last_error(&self) -> Option<String> {
        self.read_state().last_error.clone()
    }

    /// Checks immediately, then every `period` until the handle is shut down.
    pub fn spawn(self: Arc<Self>, period: Duration) -> SlaMonitorHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(
                event_name = "sla.monitor.stopped",
                tenant_id = self.tenant_label(),
                "SLA monitor stopped"
            );
        });

        SlaMonitorHandle { shutdown, join }
    }

    fn tenant_label(&self) -> &str {
        self.session.tenant_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown")
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SlaState> {
        match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SlaState> {
        match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct SlaMonitorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SlaMonitorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
