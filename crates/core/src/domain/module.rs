use serde::{Deserialize, Serialize};

/// Business area an approval request or version row belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    EsgMetrics,
    GhgAccounting,
    EsgCap,
    EsgDd,
    BrsrReport,
}

/// Where a module keeps its version rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionTable {
    pub table_name: &'static str,
    pub record_id_field: &'static str,
}

impl Module {
    pub const ALL: [Module; 5] =
        [Self::EsgMetrics, Self::GhgAccounting, Self::EsgCap, Self::EsgDd, Self::BrsrReport];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EsgMetrics => "esg_metrics",
            Self::GhgAccounting => "ghg_accounting",
            Self::EsgCap => "esg_cap",
            Self::EsgDd => "esg_dd",
            Self::BrsrReport => "brsr_report",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "esg_metrics" => Some(Self::EsgMetrics),
            "ghg_accounting" => Some(Self::GhgAccounting),
            "esg_cap" => Some(Self::EsgCap),
            "esg_dd" => Some(Self::EsgDd),
            "brsr_report" => Some(Self::BrsrReport),
            _ => None,
        }
    }

    pub fn version_table(&self) -> VersionTable {
        let (table_name, record_id_field) = match self {
            Self::EsgMetrics => ("esg_metrics_versions", "metric_id"),
            Self::GhgAccounting => ("ghg_accounting_versions", "record_id"),
            Self::EsgCap => ("esg_cap_versions", "cap_id"),
            Self::EsgDd => ("esg_dd_versions", "dd_record_id"),
            Self::BrsrReport => ("brsr_report_versions", "report_section_id"),
        };
        VersionTable { table_name, record_id_field }
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
