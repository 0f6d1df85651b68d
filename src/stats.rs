//! Ticket analytics.
//!
//! Everything here is a pure function over already loaded tickets, so the
//! numbers are identical for both store backends.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::db::{
    ticket::{self, Status, Ticket},
    user::{self, Role, User},
};

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Counts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub rejected: usize,
}

impl Counts {
    pub fn of<'a>(tickets: impl IntoIterator<Item = &'a Ticket>) -> Self {
        let mut counts = Self::default();
        for t in tickets {
            counts.add(t.status, 1);
        }
        counts
    }

    pub fn from_statuses(statuses: &HashMap<Status, usize>) -> Self {
        let mut counts = Self::default();
        for (status, n) in statuses {
            counts.add(*status, *n);
        }
        counts
    }

    fn add(&mut self, status: Status, n: usize) {
        self.total += n;
        *match status {
            Status::Pending => &mut self.pending,
            Status::InProgress => &mut self.in_progress,
            Status::Done => &mut self.done,
            Status::Rejected => &mut self.rejected,
        } += n;
    }
}

fn round(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

fn rate(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round(part as f64 / total as f64 * 100.0, 1)
    }
}

/// Hours between start and completion of a finished ticket.
fn completion_hours(t: &Ticket) -> Option<f64> {
    match (t.status, t.started_at, t.completed_at) {
        (Status::Done, Some(started), Some(completed)) => {
            Some((completed - started).as_seconds_f64() / 3600.0)
        }
        _ => None,
    }
}

fn average(values: &[f64]) -> Option<f64> {
    (!values.is_empty())
        .then(|| round(values.iter().sum::<f64>() / values.len() as f64, 2))
}

fn utc_date(at: OffsetDateTime) -> Date {
    at.to_offset(UtcOffset::UTC).date()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionTimes {
    pub completed: usize,
    pub average_hours: Option<f64>,
    pub min_hours: Option<f64>,
    pub max_hours: Option<f64>,
}

pub fn completion_times<'a>(
    tickets: impl IntoIterator<Item = &'a Ticket>,
) -> CompletionTimes {
    let hours = tickets
        .into_iter()
        .filter_map(completion_hours)
        .collect::<Vec<_>>();
    CompletionTimes {
        completed: hours.len(),
        average_hours: average(&hours),
        min_hours: hours.iter().copied().reduce(f64::min).map(|h| round(h, 2)),
        max_hours: hours.iter().copied().reduce(f64::max).map(|h| round(h, 2)),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorPerformance {
    pub executor_id: user::Id,
    pub executor_name: String,
    pub total_tickets: usize,
    pub completed_tickets: usize,
    pub in_progress_tickets: usize,
    pub completion_rate: f64,
    pub average_completion_hours: Option<f64>,
}

/// Per-executor results for tickets created at or after `since`, most
/// completed tickets first.
pub fn executor_performance(
    tickets: &[Ticket],
    executors: &[User],
    since: OffsetDateTime,
) -> Vec<ExecutorPerformance> {
    let mut performance = executors
        .iter()
        .filter(|u| u.role == Role::Executor)
        .map(|executor| {
            let assigned = tickets
                .iter()
                .filter(|t| {
                    t.executor == Some(executor.id) && t.created_at >= since
                })
                .collect::<Vec<_>>();
            let counts = Counts::of(assigned.iter().copied());
            let hours = assigned
                .iter()
                .filter_map(|t| completion_hours(t))
                .collect::<Vec<_>>();
            ExecutorPerformance {
                executor_id: executor.id,
                executor_name: executor.name.clone(),
                total_tickets: counts.total,
                completed_tickets: counts.done,
                in_progress_tickets: counts.in_progress,
                completion_rate: rate(counts.done, counts.total),
                average_completion_hours: average(&hours),
            }
        })
        .collect::<Vec<_>>();
    performance.sort_by(|a, b| {
        b.completed_tickets
            .cmp(&a.completed_tickets)
            .then_with(|| a.executor_name.cmp(&b.executor_name))
    });
    performance
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTrend {
    pub date: String,
    pub created: usize,
    pub completed: usize,
}

/// Created and completed tickets per UTC calendar day, oldest day first,
/// ending with the day of `now`.
pub fn daily_trends(
    tickets: &[Ticket],
    now: OffsetDateTime,
    days: u16,
) -> Vec<DailyTrend> {
    let today = utc_date(now);
    (0..days)
        .rev()
        .filter_map(|back| today.checked_sub(Duration::days(back.into())))
        .map(|date| DailyTrend {
            date: date.to_string(),
            created: tickets
                .iter()
                .filter(|t| utc_date(t.created_at) == date)
                .count(),
            completed: tickets
                .iter()
                .filter(|t| {
                    t.status == Status::Done
                        && t.completed_at.map(utc_date) == Some(date)
                })
                .count(),
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityStats {
    pub priority: u8,
    pub total_tickets: usize,
    pub completed_tickets: usize,
    pub completion_rate: f64,
    pub average_completion_hours: Option<f64>,
}

pub fn priority_breakdown(tickets: &[Ticket]) -> Vec<PriorityStats> {
    (1..=5)
        .map(|priority| {
            let matching = tickets
                .iter()
                .filter(|t| t.priority == priority)
                .collect::<Vec<_>>();
            let done = matching.iter().filter(|t| t.status == Status::Done);
            let hours = done
                .clone()
                .filter_map(|t| completion_hours(t))
                .collect::<Vec<_>>();
            let completed = done.count();
            PriorityStats {
                priority,
                total_tickets: matching.len(),
                completed_tickets: completed,
                completion_rate: rate(completed, matching.len()),
                average_completion_hours: average(&hours),
            }
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overdue {
    pub ticket_id: ticket::Id,
    pub title: String,
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
    pub overdue_hours: f64,
    pub priority: u8,
    pub executor_id: Option<user::Id>,
}

/// Hours an open ticket is past its deadline.
fn overdue_hours(t: &Ticket, now: OffsetDateTime) -> Option<f64> {
    (!t.status.is_terminal() && t.deadline < now)
        .then(|| round((now - t.deadline).as_seconds_f64() / 3600.0, 1))
}

/// Timing figures of a single ticket report.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub completion_hours: Option<f64>,
    pub overdue_hours: Option<f64>,
}

pub fn timing(t: &Ticket, now: OffsetDateTime) -> Timing {
    Timing {
        completion_hours: completion_hours(t).map(|h| round(h, 1)),
        overdue_hours: overdue_hours(t, now),
    }
}

/// Open tickets past their deadline, most overdue first.
pub fn overdue(tickets: &[Ticket], now: OffsetDateTime) -> Vec<Overdue> {
    let mut overdue = tickets
        .iter()
        .filter_map(|t| {
            Some(Overdue {
                ticket_id: t.id,
                title: t.title.clone(),
                status: t.status,
                deadline: t.deadline,
                overdue_hours: overdue_hours(t, now)?,
                priority: t.priority,
                executor_id: t.executor,
            })
        })
        .collect::<Vec<_>>();
    overdue.sort_by(|a, b| a.deadline.cmp(&b.deadline));
    overdue
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Load {
    pub executor_id: user::Id,
    pub executor_name: String,
    pub active_tickets: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub distribution: Vec<Load>,
    pub total_active_tickets: usize,
    pub average_load: f64,
    pub executors_count: usize,
}

pub fn workload(tickets: &[Ticket], executors: &[User]) -> Workload {
    let mut distribution = executors
        .iter()
        .filter(|u| u.role == Role::Executor)
        .map(|executor| Load {
            executor_id: executor.id,
            executor_name: executor.name.clone(),
            active_tickets: tickets
                .iter()
                .filter(|t| {
                    !t.status.is_terminal() && t.executor == Some(executor.id)
                })
                .count(),
        })
        .collect::<Vec<_>>();
    distribution.sort_by(|a, b| {
        b.active_tickets
            .cmp(&a.active_tickets)
            .then_with(|| a.executor_name.cmp(&b.executor_name))
    });

    let total = distribution.iter().map(|l| l.active_tickets).sum::<usize>();
    let average_load = if distribution.is_empty() {
        0.0
    } else {
        round(total as f64 / distribution.len() as f64, 1)
    };
    Workload {
        executors_count: distribution.len(),
        distribution,
        total_active_tickets: total,
        average_load,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub role: Role,
    pub counts: Counts,
    /// Only reported for executors.
    pub average_completion_hours: Option<f64>,
}

/// Personal numbers: created tickets for a customer, assigned ones for an
/// executor, everything for an admin.
pub fn user_summary(tickets: &[Ticket], user: &User) -> UserSummary {
    let relevant = tickets.iter().filter(|t| match user.role {
        Role::Admin => true,
        Role::Executor => t.executor == Some(user.id),
        Role::Customer => t.customer == user.id,
    });
    UserSummary {
        role: user.role,
        counts: Counts::of(relevant.clone()),
        average_completion_hours: (user.role == Role::Executor)
            .then(|| completion_times(relevant).average_hours)
            .flatten(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    pub counts: Counts,
    pub completion: CompletionTimes,
    pub executor_performance: Vec<ExecutorPerformance>,
    pub daily_trends: Vec<DailyTrend>,
    pub priorities: Vec<PriorityStats>,
    pub overdue: Vec<Overdue>,
    pub workload: Workload,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

/// Admin dashboard: top 10 executors over the last 30 days, last 7 days of
/// trends and the 20 most overdue tickets. `counts` comes from the store's
/// grouped count.
pub fn analytics(
    counts: Counts,
    tickets: &[Ticket],
    users: &[User],
    now: OffsetDateTime,
) -> Analytics {
    let mut performance =
        executor_performance(tickets, users, now - Duration::days(30));
    performance.truncate(10);
    let mut overdue = overdue(tickets, now);
    overdue.truncate(20);

    Analytics {
        counts,
        completion: completion_times(tickets),
        executor_performance: performance,
        daily_trends: daily_trends(tickets, now, 7),
        priorities: priority_breakdown(tickets),
        overdue,
        workload: workload(tickets, users),
        generated_at: now,
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestRange {
    /// Since midnight UTC.
    Daily,
    /// The last seven days.
    Weekly,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestEntry {
    pub id: ticket::Id,
    pub title: String,
    pub status: Status,
    pub priority: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Digest {
    pub range: DigestRange,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub until: OffsetDateTime,
    pub counts: Counts,
    pub average_completion_hours: Option<f64>,
    pub tickets: Vec<DigestEntry>,
}

/// Summary of tickets created within `range`, oldest first.
pub fn digest(
    tickets: &[Ticket],
    range: DigestRange,
    now: OffsetDateTime,
) -> Digest {
    let now = now.to_offset(UtcOffset::UTC);
    let since = match range {
        DigestRange::Daily => now.replace_time(time::Time::MIDNIGHT),
        DigestRange::Weekly => now - Duration::days(7),
    };
    let mut selected = tickets
        .iter()
        .filter(|t| t.created_at >= since && t.created_at <= now)
        .collect::<Vec<_>>();
    selected.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Digest {
        range,
        since,
        until: now,
        counts: Counts::of(selected.iter().copied()),
        average_completion_hours: completion_times(selected.iter().copied())
            .average_hours,
        tickets: selected
            .into_iter()
            .map(|t| DigestEntry {
                id: t.id,
                title: t.title.clone(),
                status: t.status,
                priority: t.priority,
                created_at: t.created_at,
            })
            .collect(),
    }
}
