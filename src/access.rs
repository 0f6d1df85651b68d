//! Per-role authorization rules.
//!
//! Each role carries its own [`Policy`]; callers go through [`authorize`]
//! rather than branching on the role themselves.

use derive_more::{Display, Error};
use serde::Serialize;

use crate::db::{
    ticket::{Status, Ticket},
    user::{self, Role},
};

/// Authenticated identity as resolved by the auth layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Caller {
    pub id: user::Id,
    pub role: Role,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Operation {
    /// Checked through [`Policy::can_create`], there is no ticket yet.
    #[display("create")]
    Create,
    #[display("read")]
    Read,
    /// Status transitions, comments and photo uploads.
    #[display("update")]
    Update,
    /// Assigning or reassigning the executor.
    #[display("assign")]
    Assign,
    #[display("delete")]
    Delete,
}

#[derive(Clone, Copy, Debug, Display, Error, Eq, PartialEq)]
#[display("{role} may not {operation} this ticket")]
pub struct Forbidden {
    pub role: Role,
    pub operation: Operation,
}

pub trait Policy: Sync {
    fn permits(&self, caller: user::Id, op: Operation, ticket: &Ticket) -> bool;

    /// Whether tickets may be created, optionally with an executor already
    /// assigned.
    fn can_create(&self, pre_assigned: bool) -> bool;

    /// Users, analytics, cleanup and digests.
    fn can_manage(&self) -> bool;
}

pub struct Admin;

pub struct Executor;

pub struct Customer;

impl Policy for Admin {
    fn permits(&self, _: user::Id, _: Operation, _: &Ticket) -> bool {
        true
    }

    fn can_create(&self, _: bool) -> bool {
        true
    }

    fn can_manage(&self) -> bool {
        true
    }
}

impl Policy for Executor {
    fn permits(&self, caller: user::Id, op: Operation, ticket: &Ticket) -> bool {
        let assigned = ticket.executor == Some(caller);
        match op {
            Operation::Read | Operation::Update => assigned,
            Operation::Create | Operation::Assign | Operation::Delete => false,
        }
    }

    fn can_create(&self, _: bool) -> bool {
        false
    }

    fn can_manage(&self) -> bool {
        false
    }
}

impl Policy for Customer {
    fn permits(&self, caller: user::Id, op: Operation, ticket: &Ticket) -> bool {
        let owner = ticket.customer == caller;
        match op {
            Operation::Read => owner,
            // Read-only once the ticket leaves `pending`.
            Operation::Update => owner && ticket.status == Status::Pending,
            Operation::Create => self.can_create(false),
            Operation::Assign | Operation::Delete => false,
        }
    }

    fn can_create(&self, pre_assigned: bool) -> bool {
        !pre_assigned
    }

    fn can_manage(&self) -> bool {
        false
    }
}

impl Role {
    pub fn policy(self) -> &'static dyn Policy {
        match self {
            Self::Admin => &Admin,
            Self::Executor => &Executor,
            Self::Customer => &Customer,
        }
    }
}

pub fn authorize(
    caller: &Caller,
    operation: Operation,
    ticket: &Ticket,
) -> Result<(), Forbidden> {
    if caller.role.policy().permits(caller.id, operation, ticket) {
        Ok(())
    } else {
        Err(Forbidden {
            role: caller.role,
            operation,
        })
    }
}

/// Permission summary shown to clients so they can adapt their UI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_create_tickets: bool,
    pub can_assign_tickets: bool,
    pub can_view_all_tickets: bool,
    pub can_delete_tickets: bool,
    pub can_manage_users: bool,
    pub can_generate_reports: bool,
}

pub fn permissions(role: Role) -> Permissions {
    let policy = role.policy();
    Permissions {
        can_create_tickets: policy.can_create(false),
        can_assign_tickets: policy.can_create(true) && policy.can_manage(),
        can_view_all_tickets: role == Role::Admin,
        can_delete_tickets: policy.can_manage(),
        can_manage_users: policy.can_manage(),
        can_generate_reports: policy.can_manage(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::db::ticket;

    pub(crate) fn ticket(
        customer: user::Id,
        executor: Option<user::Id>,
        status: Status,
    ) -> Ticket {
        let now = OffsetDateTime::now_utc();
        Ticket {
            id: ticket::Id::new(),
            title: "Leaking tap".to_string(),
            address: "1 Main St".to_string(),
            description: "Kitchen tap drips".to_string(),
            deadline: now,
            priority: 3,
            status,
            customer,
            executor,
            created_at: now,
            started_at: (status != Status::Pending).then_some(now),
            completed_at: (status == Status::Done).then_some(now),
            completion_comment: (status == Status::Done)
                .then(|| "fixed".to_string()),
            rejection_reason: (status == Status::Rejected)
                .then(|| "duplicate".to_string()),
            before_photo: None,
            after_photo: None,
        }
    }

    const ALL_OPS: [Operation; 4] = [
        Operation::Read,
        Operation::Update,
        Operation::Assign,
        Operation::Delete,
    ];

    #[test]
    fn admin_may_do_anything() {
        let admin = Caller {
            id: user::Id::from(1),
            role: Role::Admin,
        };
        for status in Status::ALL {
            let t = ticket(user::Id::from(2), None, status);
            for op in ALL_OPS {
                assert_eq!(authorize(&admin, op, &t), Ok(()));
            }
        }
    }

    #[test]
    fn executor_is_limited_to_assigned_tickets() {
        let me = user::Id::from(10);
        let executor = Caller {
            id: me,
            role: Role::Executor,
        };
        let mine = ticket(user::Id::from(2), Some(me), Status::InProgress);
        let other = ticket(
            user::Id::from(2),
            Some(user::Id::from(11)),
            Status::InProgress,
        );

        assert_eq!(authorize(&executor, Operation::Read, &mine), Ok(()));
        assert_eq!(authorize(&executor, Operation::Update, &mine), Ok(()));
        assert!(authorize(&executor, Operation::Assign, &mine).is_err());
        assert!(authorize(&executor, Operation::Delete, &mine).is_err());
        for op in ALL_OPS {
            assert_eq!(
                authorize(&executor, op, &other),
                Err(Forbidden {
                    role: Role::Executor,
                    operation: op,
                }),
            );
        }
    }

    #[test]
    fn customer_becomes_read_only_after_pending() {
        let me = user::Id::from(20);
        let customer = Caller {
            id: me,
            role: Role::Customer,
        };
        let pending = ticket(me, None, Status::Pending);
        assert_eq!(authorize(&customer, Operation::Update, &pending), Ok(()));

        for status in [Status::InProgress, Status::Done, Status::Rejected] {
            let t = ticket(me, Some(user::Id::from(10)), status);
            assert_eq!(authorize(&customer, Operation::Read, &t), Ok(()));
            assert!(authorize(&customer, Operation::Update, &t).is_err());
        }
    }

    #[test]
    fn customer_cannot_touch_foreign_tickets() {
        let customer = Caller {
            id: user::Id::from(20),
            role: Role::Customer,
        };
        let foreign = ticket(user::Id::from(21), None, Status::Pending);
        for op in ALL_OPS {
            assert!(authorize(&customer, op, &foreign).is_err());
        }
    }

    #[test]
    fn only_admin_creates_pre_assigned_tickets() {
        assert!(Role::Admin.policy().can_create(true));
        assert!(Role::Customer.policy().can_create(false));
        assert!(!Role::Customer.policy().can_create(true));
        assert!(!Role::Executor.policy().can_create(false));
    }

    #[test]
    fn summarizes_permissions_per_role() {
        let admin = permissions(Role::Admin);
        assert!(admin.can_assign_tickets && admin.can_manage_users);

        let customer = permissions(Role::Customer);
        assert!(customer.can_create_tickets);
        assert!(!customer.can_assign_tickets && !customer.can_view_all_tickets);

        let executor = permissions(Role::Executor);
        assert!(!executor.can_create_tickets && !executor.can_delete_tickets);
    }
}
