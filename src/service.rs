//! Ticket operations on behalf of an authenticated caller.
//!
//! Mutations of one ticket are serialized through [`Locks`]: the gate, the
//! lifecycle engine and the store commit all run under the ticket's lock, and
//! notifications go out only after the commit succeeded.

use std::{collections::HashMap, sync::Arc};

use derive_more::{Display, From};
use itertools::Itertools as _;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    access::{self, Caller, Forbidden, Operation},
    api,
    db::{
        self,
        ticket::{self, Status, Ticket},
        user::{self, Role, User},
        SharedStore,
    },
    lifecycle::{self, Change, Draft},
    media,
    notify::{self, Hub, Kind},
    stats,
};

#[derive(Debug, Display, derive_more::Error, From)]
pub enum Error {
    #[display("ticket not found")]
    #[from(ignore)]
    NotFound,

    #[display("{_0}")]
    Forbidden(Forbidden),

    #[display("{_0}")]
    #[from(ignore)]
    Validation(#[error(not(source))] String),

    #[display("{_0}")]
    #[from(ignore)]
    Conflict(#[error(not(source))] String),

    #[display("storage unavailable: {_0}")]
    Storage(db::Error),

    #[display("{_0}")]
    #[from(ignore)]
    Media(media::Error),

    /// A ticket references a user that does not exist.
    #[display("user {_0} not found")]
    #[from(ignore)]
    UserNotFound(#[error(not(source))] user::Id),
}

impl From<lifecycle::Error> for Error {
    fn from(e: lifecycle::Error) -> Self {
        match e {
            lifecycle::Error::Forbidden(e) => Self::Forbidden(e),
            lifecycle::Error::Validation(msg) => Self::Validation(msg),
            lifecycle::Error::Conflict(msg) => Self::Conflict(msg),
        }
    }
}

impl From<media::Error> for Error {
    fn from(e: media::Error) -> Self {
        if e.is_rejection() {
            Self::Validation(e.to_string())
        } else {
            Self::Media(e)
        }
    }
}

/// One mutex per ticket id.
#[derive(Default)]
pub struct Locks(Mutex<HashMap<ticket::Id, Arc<Mutex<()>>>>);

impl Locks {
    pub async fn lock(&self, id: ticket::Id) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.0.lock().await;
            // Entries nobody holds or waits for.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }
}

/// Uploaded photo not yet stored.
#[derive(Clone, Debug)]
pub struct Photo {
    pub bytes: Vec<u8>,
    /// With the leading dot, e.g. `.jpg`.
    pub extension: String,
}

#[derive(Clone, Debug, Default)]
pub struct Edit {
    pub status: Option<Status>,
    pub executor: Option<user::Id>,
    pub completion_comment: Option<String>,
    pub rejection_reason: Option<String>,
    pub before_photo: Option<Photo>,
    pub after_photo: Option<Photo>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Filter {
    pub status: Option<Status>,
    pub executor: Option<user::Id>,
}

impl Filter {
    fn matches(&self, t: &Ticket) -> bool {
        self.status.map_or(true, |s| t.status == s)
            && self.executor.map_or(true, |e| t.executor == Some(e))
    }
}

pub struct Service {
    store: SharedStore,
    media: Arc<dyn media::Storage>,
    hub: Arc<Hub>,
    locks: Arc<Locks>,
}

impl Service {
    pub fn new(
        store: SharedStore,
        media: Arc<dyn media::Storage>,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            store,
            media,
            hub,
            locks: Arc::default(),
        }
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub async fn create(
        &self,
        caller: &Caller,
        new: api::ticket::New,
    ) -> Result<api::Ticket, Error> {
        let forbidden = |operation| Forbidden {
            role: caller.role,
            operation,
        };
        let policy = caller.role.policy();
        if !policy.can_create(false) {
            return Err(forbidden(Operation::Create).into());
        }
        if new.executor_id.is_some() && !policy.can_create(true) {
            return Err(forbidden(Operation::Assign).into());
        }

        let customer = match new.customer_id {
            Some(id) if id != caller.id => {
                if caller.role != Role::Admin {
                    return Err(forbidden(Operation::Create).into());
                }
                self.require(id, Role::Customer).await?.id
            }
            _ => caller.id,
        };
        if let Some(id) = new.executor_id {
            self.require(id, Role::Executor).await?;
        }

        let ticket = lifecycle::open(
            Draft {
                title: new.title,
                address: new.address,
                description: new.description,
                deadline: new.deadline,
                priority: new.priority,
            },
            customer,
            new.executor_id,
            OffsetDateTime::now_utc(),
        )?;
        self.store.write_ticket(&ticket).await?;
        tracing::info!(
            ticket_id = %ticket.id,
            user_id = %caller.id,
            status = %ticket.status,
            "ticket created",
        );

        let mut changes = vec![Change::Created];
        if ticket.executor.is_some() {
            changes.push(Change::ExecutorAssigned);
        }
        let view = self.present(ticket).await?;
        self.announce(Kind::Created, &view, &changes).await;
        Ok(view)
    }

    pub async fn get(
        &self,
        caller: &Caller,
        id: ticket::Id,
    ) -> Result<api::Ticket, Error> {
        let ticket = self.load(id).await?;
        access::authorize(caller, Operation::Read, &ticket)?;
        self.present(ticket).await
    }

    /// Visible tickets matching `filter`, newest first.
    pub async fn list(
        &self,
        caller: &Caller,
        filter: Filter,
        offset: usize,
        limit: usize,
    ) -> Result<api::ticket::List, Error> {
        let tickets = self
            .store
            .list_tickets_for(caller.id, caller.role)
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect::<Vec<_>>();
        let total_count = tickets.len();
        let page = tickets.into_iter().skip(offset).take(limit).collect();

        Ok(api::ticket::List {
            tickets: self.present_all(page).await?,
            total_count,
        })
    }

    pub async fn update(
        &self,
        caller: &Caller,
        id: ticket::Id,
        edit: Edit,
    ) -> Result<api::Ticket, Error> {
        let _guard = self.locks.lock(id).await;

        let current = self.load(id).await?;
        access::authorize(caller, Operation::Update, &current)?;
        if let Some(executor) = edit.executor {
            access::authorize(caller, Operation::Assign, &current)?;
            self.require(executor, Role::Executor).await?;
        }

        let (before_photo, after_photo) =
            self.store_photos(edit.before_photo, edit.after_photo).await?;
        let stored = before_photo
            .iter()
            .chain(&after_photo)
            .cloned()
            .collect::<Vec<_>>();
        let update = lifecycle::Update {
            status: edit.status,
            executor: edit.executor,
            completion_comment: edit.completion_comment,
            rejection_reason: edit.rejection_reason,
            before_photo,
            after_photo,
        };

        let (ticket, changes) = match self.commit(&current, update, caller).await
        {
            Ok(committed) => committed,
            Err(e) => {
                self.remove_files(&stored).await;
                return Err(e);
            }
        };

        let replaced = current
            .photos()
            .filter(|old| !ticket.photos().any(|new| new == *old))
            .map(String::from)
            .collect::<Vec<_>>();
        self.remove_files(&replaced).await;

        let view = self.present(ticket).await?;
        if !changes.is_empty() {
            tracing::info!(
                ticket_id = %id,
                user_id = %caller.id,
                status = %view.status,
                changes = %changes.iter().join(", "),
                "ticket updated",
            );
            let kind = if changes
                .iter()
                .any(|c| matches!(c, Change::StatusChanged { .. }))
            {
                Kind::StatusChanged
            } else {
                Kind::Updated
            };
            self.announce(kind, &view, &changes).await;
        }
        Ok(view)
    }

    pub async fn delete(
        &self,
        caller: &Caller,
        id: ticket::Id,
    ) -> Result<(), Error> {
        let _guard = self.locks.lock(id).await;

        let ticket = self.load(id).await?;
        access::authorize(caller, Operation::Delete, &ticket)?;
        let photos = ticket.photos().map(String::from).collect::<Vec<_>>();
        let view = self.present(ticket).await?;

        if !self.store.delete_ticket(id).await? {
            return Err(Error::NotFound);
        }
        self.remove_files(&photos).await;
        tracing::info!(ticket_id = %id, user_id = %caller.id, "ticket deleted");

        self.announce(Kind::Deleted, &view, &[]).await;
        Ok(())
    }

    /// Counts over visible tickets, the 10 most recent of them and the
    /// caller's own 5 most recent.
    pub async fn dashboard(
        &self,
        caller: &Caller,
    ) -> Result<api::ticket::Dashboard, Error> {
        let visible =
            self.store.list_tickets_for(caller.id, caller.role).await?;
        let recent = visible.iter().take(10).cloned().collect();
        let mine = visible
            .iter()
            .filter(|t| {
                t.customer == caller.id || t.executor == Some(caller.id)
            })
            .take(5)
            .cloned()
            .collect();

        Ok(api::ticket::Dashboard {
            counts: stats::Counts::of(&visible),
            recent: self.present_all(recent).await?,
            mine: self.present_all(mine).await?,
        })
    }

    pub async fn user_summary(
        &self,
        me: &User,
    ) -> Result<stats::UserSummary, Error> {
        let visible = self.store.list_tickets_for(me.id, me.role).await?;
        Ok(stats::user_summary(&visible, me))
    }

    pub async fn analytics(&self) -> Result<stats::Analytics, Error> {
        let (counts, tickets, executors) = tokio::try_join!(
            self.store.count_tickets_by_status(),
            self.store.list_tickets(),
            self.store.list_users(Some(Role::Executor)),
        )?;
        Ok(stats::analytics(
            stats::Counts::from_statuses(&counts),
            &tickets,
            &executors,
            OffsetDateTime::now_utc(),
        ))
    }

    /// Readable by whoever may read the ticket itself.
    pub async fn report(
        &self,
        caller: &Caller,
        id: ticket::Id,
    ) -> Result<api::ticket::Report, Error> {
        let ticket = self.load(id).await?;
        access::authorize(caller, Operation::Read, &ticket)?;

        let generated_at = OffsetDateTime::now_utc();
        let timing = stats::timing(&ticket, generated_at);
        Ok(api::ticket::Report {
            ticket: self.present(ticket).await?,
            timing,
            generated_at,
        })
    }

    pub async fn digest(
        &self,
        range: stats::DigestRange,
    ) -> Result<stats::Digest, Error> {
        let tickets = self.store.list_tickets().await?;
        Ok(stats::digest(&tickets, range, OffsetDateTime::now_utc()))
    }

    /// Active executors available for assignment.
    pub async fn executors(&self) -> Result<Vec<api::User>, Error> {
        Ok(self
            .store
            .list_users(Some(Role::Executor))
            .await?
            .iter()
            .filter(|u| u.is_active)
            .map(api::User::from)
            .collect())
    }

    async fn load(&self, id: ticket::Id) -> Result<Ticket, Error> {
        self.store.get_ticket_by_id(id).await?.ok_or(Error::NotFound)
    }

    /// Active user with the given role, referenced by a request.
    async fn require(&self, id: user::Id, role: Role) -> Result<User, Error> {
        self.store
            .get_user_by_id(id)
            .await?
            .filter(|u| u.role == role && u.is_active)
            .ok_or_else(|| Error::Validation(format!("no active {role} {id}")))
    }

    async fn commit(
        &self,
        current: &Ticket,
        update: lifecycle::Update,
        caller: &Caller,
    ) -> Result<(Ticket, Vec<Change>), Error> {
        let (ticket, changes) = lifecycle::apply_transition(
            current,
            update,
            caller,
            OffsetDateTime::now_utc(),
        )?;
        if !changes.is_empty() {
            self.store.write_ticket(&ticket).await?;
        }
        Ok((ticket, changes))
    }

    async fn store_photos(
        &self,
        before: Option<Photo>,
        after: Option<Photo>,
    ) -> Result<(Option<String>, Option<String>), Error> {
        let before = match before {
            Some(p) => {
                Some(self.media.save(&p.bytes, &p.extension, "before_").await?)
            }
            None => None,
        };
        let after = match after {
            Some(p) => {
                match self.media.save(&p.bytes, &p.extension, "after_").await {
                    Ok(name) => Some(name),
                    Err(e) => {
                        self.remove_files(before.as_slice()).await;
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };
        Ok((before, after))
    }

    /// Best-effort: failures are logged and otherwise ignored.
    async fn remove_files(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.media.delete(name).await {
                tracing::warn!(%name, "failed to delete media file: {e}");
            }
        }
    }

    async fn present(&self, ticket: Ticket) -> Result<api::Ticket, Error> {
        let mut views = self.present_all(vec![ticket]).await?;
        views.pop().ok_or(Error::NotFound)
    }

    async fn present_all(
        &self,
        tickets: Vec<Ticket>,
    ) -> Result<Vec<api::Ticket>, Error> {
        let user_ids = tickets
            .iter()
            .map(|t| t.customer)
            .chain(tickets.iter().filter_map(|t| t.executor))
            .unique()
            .collect::<Vec<_>>();
        let users = self.store.get_users_by_ids(&user_ids).await?;
        let user = |id: user::Id| {
            users
                .get(&id)
                .map(api::User::from)
                .ok_or(Error::UserNotFound(id))
        };

        tickets
            .into_iter()
            .map(|t| {
                Ok::<_, Error>(api::Ticket {
                    customer: user(t.customer)?,
                    executor: t.executor.map(user).transpose()?,
                    id: t.id,
                    title: t.title,
                    address: t.address,
                    description: t.description,
                    deadline: t.deadline,
                    priority: t.priority,
                    status: t.status,
                    created_at: t.created_at,
                    started_at: t.started_at,
                    completed_at: t.completed_at,
                    completion_comment: t.completion_comment,
                    rejection_reason: t.rejection_reason,
                    before_photo: t.before_photo,
                    after_photo: t.after_photo,
                })
            })
            .collect()
    }

    async fn announce(
        &self,
        kind: Kind,
        ticket: &api::Ticket,
        changes: &[Change],
    ) {
        let event = notify::Event {
            kind,
            ticket: notify::Summary {
                id: ticket.id,
                title: ticket.title.clone(),
                status: ticket.status,
                customer_name: Some(ticket.customer.name.clone()),
                executor_name: ticket.executor.as_ref().map(|u| u.name.clone()),
            },
            changes: changes.iter().map(ToString::to_string).collect(),
            timestamp: OffsetDateTime::now_utc(),
        };
        self.hub
            .notify_ticket(
                &event,
                ticket.customer.id,
                ticket.executor.as_ref().map(|u| u.id),
            )
            .await;
    }
}
