use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{api, stats};

pub use crate::db::ticket::{Id, Status};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: Id,
    pub title: String,
    pub address: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
    pub priority: u8,
    pub status: Status,
    pub customer: api::User,
    pub executor: Option<api::User>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub completion_comment: Option<String>,
    pub rejection_reason: Option<String>,
    pub before_photo: Option<String>,
    pub after_photo: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub tickets: Vec<Ticket>,
    pub total_count: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct New {
    pub title: String,
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
    pub priority: u8,
    /// Admins may open a ticket on a customer's behalf.
    #[serde(default)]
    pub customer_id: Option<api::user::Id>,
    #[serde(default)]
    pub executor_id: Option<api::user::Id>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Dashboard {
    pub counts: stats::Counts,
    pub recent: Vec<Ticket>,
    pub mine: Vec<Ticket>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub ticket: Ticket,
    #[serde(flatten)]
    pub timing: stats::Timing,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}
