use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use esgflow_core::backend::WorkflowBackend;
use esgflow_core::domain::session::{Session, TenantId};
use esgflow_core::sla::{SlaMonitor, SlaMonitorHandle};
use tokio::sync::Mutex;
use tracing::info;

/// Identity the background monitors act as.
pub const MONITOR_USER: &str = "sla-monitor";

/// Poll intervals a monitor may go unqueried before it is stopped.
pub const IDLE_POLLS: u32 = 4;

pub const DEFAULT_MAX_MONITORS: usize = 256;

struct Running<B> {
    monitor: Arc<SlaMonitor<B>>,
    handle: SlaMonitorHandle,
}

/// One polling SLA monitor per portfolio company, started on first use.
///
/// Monitors nobody has queried for `idle_after` are stopped on the next lookup,
/// and the least recently queried one makes room once `max_monitors` run.
pub struct SlaRegistry<B> {
    backend: Arc<B>,
    poll_interval: Duration,
    critical_overdue_hours: i64,
    idle_after: Duration,
    max_monitors: usize,
    monitors: Mutex<HashMap<TenantId, Running<B>>>,
}

impl<B> SlaRegistry<B>
where
    B: WorkflowBackend + 'static,
{
    pub fn new(backend: Arc<B>, poll_interval: Duration, critical_overdue_hours: i64) -> Self {
        Self {
            backend,
            poll_interval,
            critical_overdue_hours,
            idle_after: poll_interval.saturating_mul(IDLE_POLLS),
            max_monitors: DEFAULT_MAX_MONITORS,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_limits(mut self, idle_after: Duration, max_monitors: usize) -> Self {
        self.idle_after = idle_after;
        self.max_monitors = max_monitors.max(1);
        self
    }

    pub async fn monitor_for(&self, tenant: &TenantId) -> Arc<SlaMonitor<B>> {
        let (monitor, evicted) = {
            let mut monitors = self.monitors.lock().await;
            let evicted = self.take_evictable(&mut monitors, tenant, Utc::now());
            let running = monitors
                .get(tenant)
                .filter(|running| !running.handle.is_finished())
                .map(|running| Arc::clone(&running.monitor));
            let monitor = match running {
                Some(monitor) => monitor,
                None => {
                    let monitor = self.start(tenant);
                    let handle = Arc::clone(&monitor).spawn(self.poll_interval);
                    let running = Running { monitor: Arc::clone(&monitor), handle };
                    monitors.insert(tenant.clone(), running);
                    monitor
                }
            };
            (monitor, evicted)
        };

        monitor.touch();
        for (tenant, running) in evicted {
            info!(
                event_name = "sla.monitor.evicted",
                tenant_id = %tenant.0,
                "idle SLA monitor evicted"
            );
            running.handle.shutdown().await;
        }
        monitor
    }

    pub async fn active_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.monitors.lock().await.keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Stops every monitor and waits for its task to exit.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Running<B>> =
            self.monitors.lock().await.drain().map(|(_, running)| running).collect();
        for running in drained {
            running.handle.shutdown().await;
        }
    }

    fn start(&self, tenant: &TenantId) -> Arc<SlaMonitor<B>> {
        info!(
            event_name = "sla.monitor.started",
            tenant_id = %tenant.0,
            poll_interval_secs = self.poll_interval.as_secs(),
            "SLA monitor started"
        );
        Arc::new(SlaMonitor::new(
            Arc::clone(&self.backend),
            Session::new(MONITOR_USER, tenant.0.clone()),
            self.critical_overdue_hours,
        ))
    }

    fn take_evictable(
        &self,
        monitors: &mut HashMap<TenantId, Running<B>>,
        keep: &TenantId,
        now: DateTime<Utc>,
    ) -> Vec<(TenantId, Running<B>)> {
        let idle: Vec<TenantId> = monitors
            .iter()
            .filter(|(tenant, running)| {
                *tenant != keep
                    && (now - running.monitor.last_queried_at())
                        .to_std()
                        .is_ok_and(|elapsed| elapsed > self.idle_after)
            })
            .map(|(tenant, _)| tenant.clone())
            .collect();
        let mut evicted: Vec<(TenantId, Running<B>)> = idle
            .into_iter()
            .filter_map(|tenant| monitors.remove(&tenant).map(|running| (tenant, running)))
            .collect();

        while !monitors.contains_key(keep) && monitors.len() >= self.max_monitors {
            let oldest = monitors
                .iter()
                .min_by_key(|(_, running)| running.monitor.last_queried_at())
                .map(|(tenant, _)| tenant.clone());
            match oldest.and_then(|tenant| monitors.remove(&tenant).map(|r| (tenant, r))) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }
}
