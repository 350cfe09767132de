pub mod issue;
pub mod span;
pub mod stats;
pub mod trace;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use issue::{IssueKind, PerformanceIssue, Severity};
pub use span::{Span, SpanError, SpanKind};
pub use stats::{AggregateStatistics, DurationSummary};
pub use trace::Trace;

/// Free-form key/value bag attached to traces and spans.
pub type Metadata = BTreeMap<String, String>;

/// Lifecycle state shared by traces and spans. `Success` and `Error` are
/// terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Success,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Server-side failures count as errors; client errors (4xx) do not.
    pub fn from_http_status(code: u16) -> Self {
        if code >= 500 {
            Self::Error
        } else {
            Self::Success
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "OK",
            Self::Error => "ERROR",
        }
    }
}
