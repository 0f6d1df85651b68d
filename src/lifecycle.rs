//! Ticket status lifecycle.
//!
//! ```text
//! pending ──assign / start──▶ in_progress ──comment──▶ done
//!    │                            │
//!    └──────reason──▶ rejected ◀──┘
//! ```
//!
//! `done` and `rejected` are terminal. Every operation here works on a copy
//! of the ticket, so a failed transition never leaves partial changes.

use derive_more::{Display, From};
use time::OffsetDateTime;

use crate::{
    access::{self, Caller, Forbidden, Operation},
    db::{
        ticket::{self, Status, Ticket},
        user,
    },
};

#[derive(Debug, Display, derive_more::Error, From, PartialEq)]
pub enum Error {
    #[display("{_0}")]
    Forbidden(Forbidden),

    #[display("{_0}")]
    #[from(ignore)]
    Validation(#[error(not(source))] String),

    #[display("{_0}")]
    #[from(ignore)]
    Conflict(#[error(not(source))] String),
}

/// Requested modifications of an existing ticket.
#[derive(Clone, Debug, Default)]
pub struct Update {
    pub status: Option<Status>,
    pub executor: Option<user::Id>,
    pub completion_comment: Option<String>,
    pub rejection_reason: Option<String>,
    /// Media file name of an already stored photo.
    pub before_photo: Option<String>,
    pub after_photo: Option<String>,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Change {
    #[display("ticket created")]
    Created,
    #[display("executor assigned")]
    ExecutorAssigned,
    #[display("status changed from {from} to {to}")]
    StatusChanged { from: Status, to: Status },
    #[display("completion comment added")]
    CompletionComment,
    #[display("rejection reason set")]
    RejectionReason,
    #[display("before photo uploaded")]
    BeforePhoto,
    #[display("after photo uploaded")]
    AfterPhoto,
}

/// Fields of a ticket about to be created.
#[derive(Clone, Debug)]
pub struct Draft {
    pub title: String,
    pub address: String,
    pub description: String,
    pub deadline: OffsetDateTime,
    pub priority: u8,
}

/// Builds a new ticket: `pending`, or `in_progress` when created with an
/// executor.
pub fn open(
    draft: Draft,
    customer: user::Id,
    executor: Option<user::Id>,
    now: OffsetDateTime,
) -> Result<Ticket, Error> {
    if draft.title.trim().is_empty() {
        return Err(Error::Validation("title required".to_string()));
    }
    if draft.address.trim().is_empty() {
        return Err(Error::Validation("address required".to_string()));
    }
    if !(1..=5).contains(&draft.priority) {
        return Err(Error::Validation(
            "priority must be between 1 and 5".to_string(),
        ));
    }

    Ok(Ticket {
        id: ticket::Id::new(),
        title: draft.title,
        address: draft.address,
        description: draft.description,
        deadline: draft.deadline,
        priority: draft.priority,
        status: if executor.is_some() {
            Status::InProgress
        } else {
            Status::Pending
        },
        customer,
        executor,
        created_at: now,
        started_at: executor.map(|_| now),
        completed_at: None,
        completion_comment: None,
        rejection_reason: None,
        before_photo: None,
        after_photo: None,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn start(ticket: &mut Ticket, now: OffsetDateTime, changes: &mut Vec<Change>) {
    changes.push(Change::StatusChanged {
        from: ticket.status,
        to: Status::InProgress,
    });
    ticket.status = Status::InProgress;
    ticket.started_at = Some(now);
}

/// Validates and applies `update`, returning the new ticket state and the
/// ordered list of applied changes.
///
/// Re-requesting the current status is accepted without touching
/// `started_at`/`completed_at`; those are only set on the edge that enters
/// the status.
pub fn apply_transition(
    current: &Ticket,
    update: Update,
    caller: &Caller,
    now: OffsetDateTime,
) -> Result<(Ticket, Vec<Change>), Error> {
    access::authorize(caller, Operation::Update, current)?;
    if update.executor.is_some() {
        access::authorize(caller, Operation::Assign, current)?;
    }

    let mut ticket = current.clone();
    let mut changes = Vec::new();

    if let Some(executor) = update.executor {
        if ticket.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "cannot assign an executor to a {} ticket",
                ticket.status,
            )));
        }
        ticket.executor = Some(executor);
        changes.push(Change::ExecutorAssigned);
        if ticket.status == Status::Pending {
            start(&mut ticket, now, &mut changes);
        }
    }

    let comment = non_empty(update.completion_comment);
    let reason = non_empty(update.rejection_reason);

    if let Some(to) = update.status {
        if to == Status::Done && comment.is_none() {
            return Err(Error::Validation("comment required".to_string()));
        }
        if to == Status::Rejected && reason.is_none() {
            return Err(Error::Validation("reason required".to_string()));
        }

        let from = ticket.status;
        match (from, to) {
            _ if from == to => {}
            (Status::Pending, Status::InProgress) => {
                start(&mut ticket, now, &mut changes);
            }
            (Status::InProgress, Status::Done) => {
                ticket.status = Status::Done;
                ticket.completed_at = Some(now);
                changes.push(Change::StatusChanged { from, to });
            }
            (Status::Pending | Status::InProgress, Status::Rejected) => {
                ticket.status = Status::Rejected;
                changes.push(Change::StatusChanged { from, to });
            }
            _ => {
                return Err(Error::Conflict(format!(
                    "cannot move ticket from {from} to {to}",
                )));
            }
        }
    }

    if let Some(comment) = comment {
        if ticket.status != Status::Done {
            return Err(Error::Validation(
                "completion comment applies only to done tickets".to_string(),
            ));
        }
        ticket.completion_comment = Some(comment);
        changes.push(Change::CompletionComment);
    }
    if let Some(reason) = reason {
        if ticket.status != Status::Rejected {
            return Err(Error::Validation(
                "rejection reason applies only to rejected tickets".to_string(),
            ));
        }
        ticket.rejection_reason = Some(reason);
        changes.push(Change::RejectionReason);
    }

    if let Some(name) = update.before_photo {
        ticket.before_photo = Some(name);
        changes.push(Change::BeforePhoto);
    }
    if let Some(name) = update.after_photo {
        ticket.after_photo = Some(name);
        changes.push(Change::AfterPhoto);
    }

    Ok((ticket, changes))
}
