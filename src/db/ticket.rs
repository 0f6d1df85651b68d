use std::{
    collections::{HashMap, HashSet},
    error::Error as StdError,
};

use derive_more::Display;
use enum_utils::TryFromRepr;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_postgres::{
    types::{
        accepts, private::BytesMut, to_sql_checked, FromSql, IsNull, ToSql,
        Type,
    },
    Error, Row,
};
use uuid::Uuid;

use super::{user, Client};

#[derive(Clone, Debug, PartialEq)]
pub struct Ticket {
    pub id: Id,
    pub title: String,
    pub address: String,
    pub description: String,
    pub deadline: OffsetDateTime,
    pub priority: u8,
    pub status: Status,
    pub customer: user::Id,
    pub executor: Option<user::Id>,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub completion_comment: Option<String>,
    pub rejection_reason: Option<String>,
    pub before_photo: Option<String>,
    pub after_photo: Option<String>,
}

impl Ticket {
    pub fn photos(&self) -> impl Iterator<Item = &str> {
        [self.before_photo.as_deref(), self.after_photo.as_deref()]
            .into_iter()
            .flatten()
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Id(Uuid);

impl Id {
    pub fn new() -> Self {
        Id(Uuid::new_v4())
    }
}

impl From<u128> for Id {
    fn from(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl FromSql<'_> for Id {
    accepts!(UUID);

    fn from_sql(
        ty: &Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Uuid::from_sql(ty, raw).map(Self)
    }
}

impl ToSql for Id {
    accepts!(UUID);

    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        self.0.to_sql(ty, out)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    Eq,
    Hash,
    TryFromRepr,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Status {
    /// Waiting for an executor.
    #[display("pending")]
    Pending = 1,

    /// Executor assigned or work explicitly started.
    #[display("in_progress")]
    InProgress = 2,

    /// Work finished, completion comment recorded.
    #[display("done")]
    Done = 3,

    /// Refused with a recorded reason.
    #[display("rejected")]
    Rejected = 4,
}

impl Status {
    pub const ALL: [Self; 4] =
        [Self::Pending, Self::InProgress, Self::Done, Self::Rejected];

    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }
}

impl FromSql<'_> for Status {
    accepts!(INT2);

    fn from_sql(
        ty: &Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        let repr = i16::from_sql(ty, raw)?;
        let repr = u8::try_from(repr)?;
        let status = Self::try_from(repr).map_err(|_| "invalid status")?;
        Ok(status)
    }
}

impl ToSql for Status {
    accepts!(INT2);

    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        let repr = i16::from((*self) as u8);
        repr.to_sql(ty, out)
    }
}

const COLUMNS: &str = "\
    id, title, address, description, deadline, priority, status, \
    customer_id, executor_id, created_at, started_at, completed_at, \
    completion_comment, rejection_reason, before_photo, after_photo";

fn from_row(row: &Row) -> Ticket {
    Ticket {
        id: row.get("id"),
        title: row.get("title"),
        address: row.get("address"),
        description: row.get("description"),
        deadline: row.get("deadline"),
        priority: u8::try_from(row.get::<_, i16>("priority")).unwrap_or(1),
        status: row.get("status"),
        customer: row.get("customer_id"),
        executor: row.get("executor_id"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        completion_comment: row.get("completion_comment"),
        rejection_reason: row.get("rejection_reason"),
        before_photo: row.get("before_photo"),
        after_photo: row.get("after_photo"),
    }
}

impl Client {
    pub async fn get_ticket_by_id(
        &self,
        id: Id,
    ) -> Result<Option<Ticket>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} \
             FROM tickets \
             WHERE id = $1"
        );
        Ok(self.0.query_opt(&sql, &[&id]).await?.as_ref().map(from_row))
    }

    pub async fn list_tickets_for(
        &self,
        user_id: user::Id,
        role: user::Role,
    ) -> Result<Vec<Ticket>, Error> {
        let filter = match role {
            user::Role::Admin => "$1::UUID IS NOT NULL",
            user::Role::Executor => "executor_id = $1",
            user::Role::Customer => "customer_id = $1",
        };
        let sql = format!(
            "SELECT {COLUMNS} \
             FROM tickets \
             WHERE {filter} \
             ORDER BY created_at DESC, \
                      id DESC"
        );
        Ok(self
            .0
            .query(&sql, &[&user_id])
            .await?
            .iter()
            .map(from_row)
            .collect())
    }

    pub async fn list_tickets(&self) -> Result<Vec<Ticket>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} \
             FROM tickets \
             ORDER BY created_at DESC, \
                      id DESC"
        );
        Ok(self.0.query(&sql, &[]).await?.iter().map(from_row).collect())
    }

    pub async fn write_ticket(&self, ticket: &Ticket) -> Result<(), Error> {
        const SQL: &str = "\
            INSERT INTO tickets (id, title, address, description, deadline, \
                                 priority, status, customer_id, executor_id, \
                                 created_at, started_at, completed_at, \
                                 completion_comment, rejection_reason, \
                                 before_photo, after_photo) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, \
                    $9, $10, $11, $12, $13, $14, $15, $16) \
            ON CONFLICT (id) DO UPDATE \
            SET title = EXCLUDED.title, \
                address = EXCLUDED.address, \
                description = EXCLUDED.description, \
                deadline = EXCLUDED.deadline, \
                priority = EXCLUDED.priority, \
                status = EXCLUDED.status, \
                customer_id = EXCLUDED.customer_id, \
                executor_id = EXCLUDED.executor_id, \
                started_at = EXCLUDED.started_at, \
                completed_at = EXCLUDED.completed_at, \
                completion_comment = EXCLUDED.completion_comment, \
                rejection_reason = EXCLUDED.rejection_reason, \
                before_photo = EXCLUDED.before_photo, \
                after_photo = EXCLUDED.after_photo";

        self.0
            .execute(
                SQL,
                &[
                    &ticket.id,
                    &ticket.title,
                    &ticket.address,
                    &ticket.description,
                    &ticket.deadline,
                    &i16::from(ticket.priority),
                    &ticket.status,
                    &ticket.customer,
                    &ticket.executor,
                    &ticket.created_at,
                    &ticket.started_at,
                    &ticket.completed_at,
                    &ticket.completion_comment,
                    &ticket.rejection_reason,
                    &ticket.before_photo,
                    &ticket.after_photo,
                ],
            )
            .await
            .map(drop)
    }

    pub async fn delete_ticket(&self, id: Id) -> Result<bool, Error> {
        const SQL: &str = "DELETE FROM tickets WHERE id = $1";
        Ok(self.0.execute(SQL, &[&id]).await? > 0)
    }

    pub async fn count_tickets_by_status(
        &self,
    ) -> Result<HashMap<Status, usize>, Error> {
        const SQL: &str = "\
            SELECT status, COUNT(*) AS count \
            FROM tickets \
            GROUP BY status";
        Ok(self
            .0
            .query(SQL, &[])
            .await?
            .into_iter()
            .map(|row| {
                let count = row.get::<_, i64>("count");
                (row.get("status"), usize::try_from(count).unwrap_or(0))
            })
            .collect())
    }

    pub async fn list_tickets_created_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<Ticket>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} \
             FROM tickets \
             WHERE created_at <= $1 \
             ORDER BY created_at, \
                      id"
        );
        Ok(self
            .0
            .query(&sql, &[&cutoff])
            .await?
            .iter()
            .map(from_row)
            .collect())
    }

    pub async fn photo_paths(&self) -> Result<HashSet<String>, Error> {
        const SQL: &str = "\
            SELECT before_photo AS path FROM tickets \
            WHERE before_photo IS NOT NULL \
            UNION \
            SELECT after_photo AS path FROM tickets \
            WHERE after_photo IS NOT NULL";
        Ok(self
            .0
            .query(SQL, &[])
            .await?
            .into_iter()
            .map(|row| row.get("path"))
            .collect())
    }
}
