pub mod memory;
pub mod ticket;
pub mod user;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use derive_more::{Display, From};
use time::OffsetDateTime;
use tokio::task;
use tokio_postgres::NoTls;

use crate::config;

pub use self::{ticket::Ticket, user::User};

const SCHEMA: &str = include_str!("../../schema.sql");

#[derive(Debug, Display, derive_more::Error, From)]
pub enum Error {
    #[display("postgres: {_0}")]
    Postgres(tokio_postgres::Error),

    #[display("store unavailable: {_0}")]
    #[from(ignore)]
    Unavailable(#[error(not(source))] String),
}

/// Persistence seam shared by the PostgreSQL client and the in-memory store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user_by_id(&self, id: user::Id) -> Result<Option<User>, Error>;

    async fn get_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<User>, Error>;

    async fn get_users_by_ids(
        &self,
        ids: &[user::Id],
    ) -> Result<HashMap<user::Id, User>, Error>;

    async fn list_users(
        &self,
        role: Option<user::Role>,
    ) -> Result<Vec<User>, Error>;

    async fn write_user(&self, user: &User) -> Result<(), Error>;

    async fn get_ticket_by_id(
        &self,
        id: ticket::Id,
    ) -> Result<Option<Ticket>, Error>;

    /// Tickets visible to the user, newest first: own tickets for a
    /// customer, assigned ones for an executor, all of them for an admin.
    async fn list_tickets_for(
        &self,
        user_id: user::Id,
        role: user::Role,
    ) -> Result<Vec<Ticket>, Error>;

    async fn list_tickets(&self) -> Result<Vec<Ticket>, Error>;

    async fn write_ticket(&self, ticket: &Ticket) -> Result<(), Error>;

    /// Returns `false` if there was no such ticket.
    async fn delete_ticket(&self, id: ticket::Id) -> Result<bool, Error>;

    async fn count_tickets_by_status(
        &self,
    ) -> Result<HashMap<ticket::Status, usize>, Error>;

    async fn list_tickets_created_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<Ticket>, Error>;

    /// Media file names referenced by any ticket.
    async fn photo_paths(&self) -> Result<HashSet<String>, Error>;
}

pub type SharedStore = Arc<dyn Store>;

/// Opens the configured store. PostgreSQL connections are driven by a
/// spawned task and the schema is applied before returning.
pub async fn open(config: &config::Db) -> Result<SharedStore, Error> {
    if config.url.starts_with("memory:") {
        tracing::warn!("using in-memory store, data will not survive restart");
        return Ok(Arc::new(memory::Store::default()));
    }

    let client = connect(config).await?;
    client.migrate().await?;
    Ok(Arc::new(client))
}

pub async fn connect(config: &config::Db) -> Result<Client, Error> {
    let (client, connection) = tokio_postgres::connect(&config.url, NoTls).await?;

    task::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("database connection failed: {e}");
        }
    });

    Ok(Client(client))
}

pub struct Client(tokio_postgres::Client);

impl Client {
    pub async fn migrate(&self) -> Result<(), Error> {
        self.0.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for Client {
    async fn get_user_by_id(&self, id: user::Id) -> Result<Option<User>, Error> {
        Ok(Client::get_user_by_id(self, id).await?)
    }

    async fn get_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<User>, Error> {
        Ok(Client::get_user_by_email(self, email).await?)
    }

    async fn get_users_by_ids(
        &self,
        ids: &[user::Id],
    ) -> Result<HashMap<user::Id, User>, Error> {
        Ok(Client::get_users_by_ids(self, ids).await?)
    }

    async fn list_users(
        &self,
        role: Option<user::Role>,
    ) -> Result<Vec<User>, Error> {
        Ok(Client::list_users(self, role).await?)
    }

    async fn write_user(&self, user: &User) -> Result<(), Error> {
        Ok(Client::write_user(self, user).await?)
    }

    async fn get_ticket_by_id(
        &self,
        id: ticket::Id,
    ) -> Result<Option<Ticket>, Error> {
        Ok(Client::get_ticket_by_id(self, id).await?)
    }

    async fn list_tickets_for(
        &self,
        user_id: user::Id,
        role: user::Role,
    ) -> Result<Vec<Ticket>, Error> {
        Ok(Client::list_tickets_for(self, user_id, role).await?)
    }

    async fn list_tickets(&self) -> Result<Vec<Ticket>, Error> {
        Ok(Client::list_tickets(self).await?)
    }

    async fn write_ticket(&self, ticket: &Ticket) -> Result<(), Error> {
        Ok(Client::write_ticket(self, ticket).await?)
    }

    async fn delete_ticket(&self, id: ticket::Id) -> Result<bool, Error> {
        Ok(Client::delete_ticket(self, id).await?)
    }

    async fn count_tickets_by_status(
        &self,
    ) -> Result<HashMap<ticket::Status, usize>, Error> {
        Ok(Client::count_tickets_by_status(self).await?)
    }

    async fn list_tickets_created_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<Ticket>, Error> {
        Ok(Client::list_tickets_created_before(self, cutoff).await?)
    }

    async fn photo_paths(&self) -> Result<HashSet<String>, Error> {
        Ok(Client::photo_paths(self).await?)
    }
}
