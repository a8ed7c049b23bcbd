pub mod monitor;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus, Priority};
use crate::domain::module::Module;
use crate::domain::session::UserId;

pub use monitor::{SlaMonitor, SlaMonitorHandle, TickOutcome};

pub const DEFAULT_CRITICAL_OVERDUE_HOURS: i64 = 48;

/// Review deadline per priority, counted from submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaPolicy {
    pub critical_hours: u32,
    pub high_hours: u32,
    pub medium_hours: u32,
    pub low_hours: u32,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self { critical_hours: 4, high_hours: 24, medium_hours: 72, low_hours: 168 }
    }
}

impl SlaPolicy {
    pub fn window_hours(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.critical_hours,
            Priority::High => self.high_hours,
            Priority::Medium => self.medium_hours,
            Priority::Low => self.low_hours,
        }
    }

    pub fn due_at(&self, priority: Priority, submitted_at: DateTime<Utc>) -> DateTime<Utc> {
        submitted_at + Duration::hours(i64::from(self.window_hours(priority)))
    }
}

/// Open request past its deadline. Derived on every check, never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaAlert {
    pub request_id: ApprovalId,
    pub module: Module,
    pub record_id: String,
    pub status: ApprovalStatus,
    pub priority: Priority,
    pub maker_id: UserId,
    pub assigned_checker_id: Option<UserId>,
    pub materiality_flag: bool,
    pub due_at: DateTime<Utc>,
    pub hours_overdue: i64,
}

impl SlaAlert {
    pub fn is_critical(&self, critical_overdue_hours: i64) -> bool {
        self.priority == Priority::Critical || self.hours_overdue > critical_overdue_hours
    }
}

/// Alerts for every open request with `due_at < now`, most overdue first.
pub fn overdue_alerts(requests: &[ApprovalRequest], now: DateTime<Utc>) -> Vec<SlaAlert> {
    let mut alerts: Vec<SlaAlert> = requests
        .iter()
        .filter(|request| request.is_overdue_at(now))
        .filter_map(|request| {
            let due_at = request.due_at?;
            Some(SlaAlert {
                request_id: request.id.clone(),
                module: request.module,
                record_id: request.record_id.clone(),
                status: request.status,
                priority: request.priority,
                maker_id: request.maker_id.clone(),
                assigned_checker_id: request.assigned_checker_id.clone(),
                materiality_flag: request.materiality_flag,
                due_at,
                hours_overdue: (now - due_at).num_hours(),
            })
        })
        .collect();

    alerts.sort_by(|left, right| {
        right.hours_overdue.cmp(&left.hours_overdue).then_with(|| left.due_at.cmp(&right.due_at))
    });
    alerts
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::{overdue_alerts, SlaPolicy, DEFAULT_CRITICAL_OVERDUE_HOURS};
    use crate::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus, Priority, RecordType};
    use crate::domain::module::Module;
    use crate::domain::session::{TenantId, UserId};

    fn open_request(id: &str, priority: Priority, due_offset_minutes: i64) -> ApprovalRequest {
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap();
        ApprovalRequest {
            id: ApprovalId(id.to_string()),
            tenant_id: TenantId("pc-1".to_string()),
            module: Module::GhgAccounting,
            record_id: format!("rec-{id}"),
            record_type: RecordType::Update,
            current_data: json!({}),
            previous_data: None,
            change_summary: None,
            status: ApprovalStatus::PendingReview,
            maker_id: UserId("maker".to_string()),
            assigned_checker_id: None,
            priority,
            due_at: Some(now + Duration::minutes(due_offset_minutes)),
            materiality_flag: false,
            checker_comment: None,
            reviewed_at: None,
            created_at: now - Duration::days(5),
            updated_at: now,
        }
    }

    #[test]
    fn policy_due_dates_follow_priority_windows() {
        let policy = SlaPolicy::default();
        let submitted = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(policy.due_at(Priority::Critical, submitted), submitted + Duration::hours(4));
        assert_eq!(policy.due_at(Priority::High, submitted), submitted + Duration::hours(24));
        assert_eq!(policy.due_at(Priority::Medium, submitted), submitted + Duration::hours(72));
        assert_eq!(policy.due_at(Priority::Low, submitted), submitted + Duration::hours(168));
    }

    #[test]
    fn alerts_floor_hours_and_sort_most_overdue_first() {
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap();
        let requests = vec![
            open_request("a", Priority::Low, -90),
            open_request("b", Priority::Medium, -(50 * 60)),
            open_request("c", Priority::High, 0),
            open_request("d", Priority::High, 30),
        ];

        let alerts = overdue_alerts(&requests, now);

        assert_eq!(alerts.len(), 2, "deadline equal to now or in the future is not overdue");
        assert_eq!(alerts[0].request_id.0, "b");
        assert_eq!(alerts[0].hours_overdue, 50);
        assert_eq!(alerts[1].request_id.0, "a");
        assert_eq!(alerts[1].hours_overdue, 1);
    }

    #[test]
    fn high_priority_fifty_hours_late_is_critical() {
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap();
        let alerts = overdue_alerts(&[open_request("late", Priority::High, -(50 * 60))], now);

        assert!(alerts[0].is_critical(DEFAULT_CRITICAL_OVERDUE_HOURS));
    }

    #[test]
    fn critical_priority_is_critical_regardless_of_lateness() {
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap();
        let alerts = overdue_alerts(
            &[open_request("crit", Priority::Critical, -5), open_request("mild", Priority::Low, -5)],
            now,
        );

        let critical: Vec<_> =
            alerts.iter().filter(|alert| alert.is_critical(DEFAULT_CRITICAL_OVERDUE_HOURS)).collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].request_id.0, "crit");
    }

    #[test]
    fn closed_requests_never_alert() {
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap();
        let mut approved = open_request("done", Priority::Critical, -(100 * 60));
        approved.status = ApprovalStatus::Approved;

        assert!(overdue_alerts(&[approved], now).is_empty());
    }
}
