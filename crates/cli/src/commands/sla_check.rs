use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use esgflow_core::domain::module::Module;
use esgflow_core::domain::session::Session;
use esgflow_core::sla::SlaMonitor;
use esgflow_db::{connect_with_settings, SqlWorkflowBackend};
use serde_json::json;

use crate::commands::{prepare, CommandResult};

/// Identity recorded for checks run from the operator CLI.
pub const CLI_OPERATOR: &str = "esgflow-cli";

#[derive(Clone, Debug, Default)]
pub struct SlaCheckOptions {
    pub tenant: String,
    pub module: Option<String>,
    pub critical_only: bool,
    pub fail_on_critical: bool,
}

/// One SLA pass over a tenant's open requests.
///
/// Exit codes: 0 ok, 1 critical alerts with `fail_on_critical`, 2 config,
/// 3 runtime, 4 database, 6 invalid arguments, 7 check failure.
pub fn run(options: SlaCheckOptions) -> CommandResult {
    let tenant = options.tenant.trim().to_string();
    if tenant.is_empty() {
        return CommandResult::failure(
            "sla-check",
            "invalid_argument",
            "--tenant must not be empty",
            6,
        );
    }
    let module = match options.module.as_deref().map(str::trim) {
        None => None,
        Some(raw) => match Module::parse(raw) {
            Some(module) => Some(module),
            None => {
                return CommandResult::failure(
                    "sla-check",
                    "invalid_argument",
                    format!("unknown module `{raw}`"),
                    6,
                );
            }
        },
    };

    let (config, runtime) = match prepare("sla-check") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        let backend =
            Arc::new(SqlWorkflowBackend::new(pool.clone()).with_sla_policy(config.sla.policy));
        let monitor = SlaMonitor::new(
            backend,
            Session::new(CLI_OPERATOR, tenant.clone()),
            config.sla.critical_overdue_hours,
        );
        let checked = monitor.check_sla_violations().await;
        pool.close().await;
        checked.map_err(|error| ("sla_check", error.to_string(), 7u8))?;

        let alerts = match (module, options.critical_only) {
            (Some(module), true) => monitor
                .critical_alerts()
                .into_iter()
                .filter(|alert| alert.module == module)
                .collect(),
            (Some(module), false) => monitor.alerts_by_module(module),
            (None, true) => monitor.critical_alerts(),
            (None, false) => monitor.alerts(),
        };
        let critical = alerts
            .iter()
            .filter(|alert| alert.is_critical(config.sla.critical_overdue_hours))
            .count();
        Ok::<_, (&'static str, String, u8)>((alerts, critical))
    });

    match result {
        Ok((alerts, critical)) => {
            let message = format!(
                "{} overdue approval request(s) for `{tenant}`, {critical} critical",
                alerts.len()
            );
            let details = json!({
                "tenant_id": tenant,
                "checked_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                "critical": critical,
                "alerts": alerts,
            });
            let outcome = CommandResult::success_with_details("sla-check", message, Some(details));
            if options.fail_on_critical && critical > 0 {
                outcome.with_exit_code(1)
            } else {
                outcome
            }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sla-check", error_class, message, exit_code)
        }
    }
}
