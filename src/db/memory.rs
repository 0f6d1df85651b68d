//! In-process [`Store`] used for local runs (`memory://`) and tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{ticket, user, Error, Ticket, User};

#[derive(Default)]
pub struct Store {
    users: RwLock<HashMap<user::Id, User>>,
    tickets: RwLock<HashMap<ticket::Id, Ticket>>,
}

fn newest_first(mut tickets: Vec<Ticket>) -> Vec<Ticket> {
    tickets.sort_by(|a, b| {
        b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
    });
    tickets
}

#[async_trait]
impl super::Store for Store {
    async fn get_user_by_id(&self, id: user::Id) -> Result<Option<User>, Error> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn get_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<User>, Error> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn get_users_by_ids(
        &self,
        ids: &[user::Id],
    ) -> Result<HashMap<user::Id, User>, Error> {
        let users = self.users.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| users.get(id).map(|u| (*id, u.clone())))
            .collect())
    }

    async fn list_users(
        &self,
        role: Option<user::Role>,
    ) -> Result<Vec<User>, Error> {
        let mut users = self
            .users
            .read()
            .await
            .values()
            .filter(|u| role.map_or(true, |r| u.role == r))
            .cloned()
            .collect::<Vec<_>>();
        users.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        });
        Ok(users)
    }

    async fn write_user(&self, user: &User) -> Result<(), Error> {
        self.users.write().await.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_ticket_by_id(
        &self,
        id: ticket::Id,
    ) -> Result<Option<Ticket>, Error> {
        Ok(self.tickets.read().await.get(&id).cloned())
    }

    async fn list_tickets_for(
        &self,
        user_id: user::Id,
        role: user::Role,
    ) -> Result<Vec<Ticket>, Error> {
        let tickets = self
            .tickets
            .read()
            .await
            .values()
            .filter(|t| match role {
                user::Role::Admin => true,
                user::Role::Executor => t.executor == Some(user_id),
                user::Role::Customer => t.customer == user_id,
            })
            .cloned()
            .collect();
        Ok(newest_first(tickets))
    }

    async fn list_tickets(&self) -> Result<Vec<Ticket>, Error> {
        let tickets = self.tickets.read().await.values().cloned().collect();
        Ok(newest_first(tickets))
    }

    async fn write_ticket(&self, ticket: &Ticket) -> Result<(), Error> {
        self.tickets.write().await.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn delete_ticket(&self, id: ticket::Id) -> Result<bool, Error> {
        Ok(self.tickets.write().await.remove(&id).is_some())
    }

    async fn count_tickets_by_status(
        &self,
    ) -> Result<HashMap<ticket::Status, usize>, Error> {
        let mut counts = HashMap::new();
        for t in self.tickets.read().await.values() {
            *counts.entry(t.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn list_tickets_created_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<Ticket>, Error> {
        let mut tickets = self
            .tickets
            .read()
            .await
            .values()
            .filter(|t| t.created_at <= cutoff)
            .cloned()
            .collect::<Vec<_>>();
        tickets.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        });
        Ok(tickets)
    }

    async fn photo_paths(&self) -> Result<HashSet<String>, Error> {
        Ok(self
            .tickets
            .read()
            .await
            .values()
            .flat_map(|t| t.photos().map(String::from).collect::<Vec<_>>())
            .collect())
    }
}
