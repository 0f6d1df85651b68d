//! Live ticket notifications.
//!
//! [`Hub`] maps each connected user to at most one outbound queue. Delivery
//! is best-effort: absent users miss the event, and a queue that is closed
//! or stays full past the send timeout is dropped as if the user
//! disconnected.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use futures::future;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{
    sync::{mpsc, RwLock},
    time::timeout,
};

use crate::{
    config::{self, Audience},
    db::{
        ticket::{self, Status},
        user::{self, Role},
    },
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Created,
    Updated,
    StatusChanged,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: ticket::Id,
    pub title: String,
    pub status: Status,
    pub customer_name: Option<String>,
    pub executor_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: Kind,
    pub ticket: Summary,
    pub changes: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Identifies one registration, so a closing socket only removes itself and
/// never the connection that replaced it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionId(u64);

struct Connection {
    id: ConnectionId,
    role: Role,
    sender: mpsc::Sender<Event>,
}

pub struct Hub {
    connections: RwLock<HashMap<user::Id, Connection>>,
    next_id: AtomicU64,
    send_timeout: Duration,
    buffer: usize,
    audience: Audience,
}

impl Hub {
    pub fn new(config: &config::Notify) -> Self {
        Self {
            connections: RwLock::default(),
            next_id: AtomicU64::new(1),
            send_timeout: config.send_timeout,
            buffer: config.buffer.max(1),
            audience: config.audience,
        }
    }

    /// Creates a queue sized for one connection.
    pub fn channel(&self) -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
        mpsc::channel(self.buffer)
    }

    /// Registers `sender` for the user, replacing any previous connection.
    ///
    /// The replaced sender is dropped, which ends the stale receiver's
    /// stream and lets its socket task close.
    pub async fn register(
        &self,
        user_id: user::Id,
        role: Role,
        sender: mpsc::Sender<Event>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let replaced = self
            .connections
            .write()
            .await
            .insert(user_id, Connection { id, role, sender });
        if replaced.is_some() {
            tracing::info!(%user_id, "replaced stale notification connection");
        } else {
            tracing::debug!(%user_id, "notification connection registered");
        }
        id
    }

    pub async fn unregister(&self, user_id: user::Id) {
        if self.connections.write().await.remove(&user_id).is_some() {
            tracing::debug!(%user_id, "notification connection removed");
        }
    }

    /// Removes the user's connection only if it is still `connection`.
    pub async fn release(&self, user_id: user::Id, connection: ConnectionId) {
        let mut connections = self.connections.write().await;
        if connections.get(&user_id).is_some_and(|c| c.id == connection) {
            connections.remove(&user_id);
            tracing::debug!(%user_id, "notification connection released");
        }
    }

    pub async fn is_connected(&self, user_id: user::Id) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }

    pub async fn send_to(&self, user_id: user::Id, event: &Event) {
        let target = self
            .connections
            .read()
            .await
            .get(&user_id)
            .map(|c| (c.id, c.sender.clone()));
        if let Some((connection, sender)) = target {
            self.deliver(user_id, connection, sender, event).await;
        }
    }

    /// Delivers to every connection except `exclude`.
    pub async fn broadcast(&self, event: &Event, exclude: Option<user::Id>) {
        self.fan_out(event, |user_id, _| Some(user_id) != exclude).await;
    }

    /// Sends a ticket event to its customer, its executor and the configured
    /// audience. Each user receives it at most once.
    pub async fn notify_ticket(
        &self,
        event: &Event,
        customer: user::Id,
        executor: Option<user::Id>,
    ) {
        let audience = self.audience;
        self.fan_out(event, |user_id, role| {
            user_id == customer
                || Some(user_id) == executor
                || match audience {
                    Audience::Admins => role == Role::Admin,
                    Audience::Everyone => true,
                }
        })
        .await;
    }

    async fn fan_out(
        &self,
        event: &Event,
        include: impl Fn(user::Id, Role) -> bool,
    ) {
        let targets = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(user_id, c)| include(**user_id, c.role))
            .map(|(user_id, c)| (*user_id, c.id, c.sender.clone()))
            .collect::<Vec<_>>();

        future::join_all(targets.into_iter().map(
            |(user_id, connection, sender)| {
                self.deliver(user_id, connection, sender, event)
            },
        ))
        .await;
    }

    async fn deliver(
        &self,
        user_id: user::Id,
        connection: ConnectionId,
        sender: mpsc::Sender<Event>,
        event: &Event,
    ) {
        match timeout(self.send_timeout, sender.send(event.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::debug!(%user_id, "notification receiver closed");
                self.release(user_id, connection).await;
            }
            Err(_) => {
                tracing::warn!(%user_id, "notification send timed out");
                self.release(user_id, connection).await;
            }
        }
    }
}
