use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::module::Module;
use crate::domain::session::{TenantId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    PendingReview,
    InReview,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending_review" => Some(Self::PendingReview),
            "in_review" => Some(Self::InReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Still waiting on a checker decision.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::PendingReview | Self::InReview)
    }

    /// Position in the forward-only lifecycle; terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::PendingReview => 0,
            Self::InReview => 1,
            Self::Approved | Self::Rejected => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Kind of change the maker is proposing for the business record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Create,
    Update,
    Delete,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Checker decision on an open request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
    RequestChange,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestChange => "request_change",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub tenant_id: TenantId,
    pub module: Module,
    pub record_id: String,
    pub record_type: RecordType,
    pub current_data: Value,
    pub previous_data: Option<Value>,
    pub change_summary: Option<String>,
    pub status: ApprovalStatus,
    pub maker_id: UserId,
    pub assigned_checker_id: Option<UserId>,
    pub priority: Priority,
    pub due_at: Option<DateTime<Utc>>,
    pub materiality_flag: bool,
    pub checker_comment: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Open and past its deadline. A deadline equal to `now` is not overdue.
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.due_at.is_some_and(|due_at| due_at < now)
    }
}

/// Maker submission payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewApprovalRequest {
    pub module: Module,
    pub record_id: String,
    pub record_type: RecordType,
    pub current_data: Value,
    #[serde(default)]
    pub previous_data: Option<Value>,
    #[serde(default)]
    pub change_summary: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub materiality_flag: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessApproval {
    pub request_id: ApprovalId,
    pub action: ApprovalAction,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilter {
    pub module: Option<Module>,
    pub status: Option<ApprovalStatus>,
}

impl RequestFilter {
    pub fn matches(&self, request: &ApprovalRequest) -> bool {
        self.module.map_or(true, |module| request.module == module)
            && self.status.map_or(true, |status| request.status == status)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Submit,
    AssignChecker,
    Approve,
    Reject,
    RequestChange,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::AssignChecker => "assign_checker",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestChange => "request_change",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "submit" => Some(Self::Submit),
            "assign_checker" => Some(Self::AssignChecker),
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "request_change" => Some(Self::RequestChange),
            _ => None,
        }
    }
}

impl From<ApprovalAction> for HistoryAction {
    fn from(action: ApprovalAction) -> Self {
        match action {
            ApprovalAction::Approve => Self::Approve,
            ApprovalAction::Reject => Self::Reject,
            ApprovalAction::RequestChange => Self::RequestChange,
        }
    }
}

/// One row of the `approval_history` trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalHistoryEntry {
    pub id: String,
    pub request_id: ApprovalId,
    pub action: HistoryAction,
    pub from_status: Option<ApprovalStatus>,
    pub to_status: ApprovalStatus,
    pub actor_id: UserId,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::{
        ApprovalId, ApprovalRequest, ApprovalStatus, HistoryAction, Priority, RecordType,
        RequestFilter,
    };
    use crate::domain::module::Module;
    use crate::domain::session::{TenantId, UserId};

    fn request(status: ApprovalStatus, due_in_hours: Option<i64>) -> ApprovalRequest {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        ApprovalRequest {
            id: ApprovalId("apr-1".to_string()),
            tenant_id: TenantId("pc-1".to_string()),
            module: Module::EsgMetrics,
            record_id: "metric-9".to_string(),
            record_type: RecordType::Update,
            current_data: json!({ "value": 10 }),
            previous_data: None,
            change_summary: None,
            status,
            maker_id: UserId("maker".to_string()),
            assigned_checker_id: None,
            priority: Priority::Medium,
            due_at: due_in_hours.map(|hours| now + Duration::hours(hours)),
            materiality_flag: false,
            checker_comment: None,
            reviewed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_and_priority_round_trip_from_storage_encoding() {
        for status in [
            ApprovalStatus::PendingReview,
            ApprovalStatus::InReview,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
        ] {
            assert_eq!(ApprovalStatus::parse(status.as_str()), Some(status));
        }
        for priority in [Priority::Low, Priority::Medium, Priority::High, Priority::Critical] {
            assert_eq!(Priority::parse(priority.as_str()), Some(priority));
        }
        for record_type in [RecordType::Create, RecordType::Update, RecordType::Delete] {
            assert_eq!(RecordType::parse(record_type.as_str()), Some(record_type));
        }
        assert_eq!(HistoryAction::parse("assign_checker"), Some(HistoryAction::AssignChecker));
    }

    #[test]
    fn overdue_uses_strict_comparison_and_ignores_closed_requests() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        assert!(!request(ApprovalStatus::PendingReview, Some(0)).is_overdue_at(now));
        assert!(request(ApprovalStatus::PendingReview, Some(-1)).is_overdue_at(now));
        assert!(request(ApprovalStatus::InReview, Some(-1)).is_overdue_at(now));
        assert!(!request(ApprovalStatus::Approved, Some(-100)).is_overdue_at(now));
        assert!(!request(ApprovalStatus::Rejected, Some(-100)).is_overdue_at(now));
        assert!(!request(ApprovalStatus::PendingReview, None).is_overdue_at(now));
    }

    #[test]
    fn filter_matches_on_module_and_status() {
        let pending = request(ApprovalStatus::PendingReview, None);
        assert!(RequestFilter::default().matches(&pending));
        assert!(RequestFilter { module: Some(Module::EsgMetrics), status: None }.matches(&pending));
        assert!(!RequestFilter { module: Some(Module::EsgCap), status: None }.matches(&pending));
        assert!(!RequestFilter { module: None, status: Some(ApprovalStatus::Approved) }
            .matches(&pending));
    }
}
