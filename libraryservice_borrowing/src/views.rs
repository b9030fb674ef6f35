//! Read-only views computed from a set of borrowings at a given moment.
//!
//! Nothing here touches the store, so the same functions serve one-shot queries
//! and live subscription snapshots alike. Active loans that are already past
//! their due date are treated as overdue even if the stored status has not been
//! updated yet.

use std::cmp::Reverse;

use chrono::{DateTime, Datelike, Utc};

use crate::api::{
    Book, Borrowing, BorrowingStatus, LatenessRecord, LibraryStatistics, Notification, Timestamp,
    Urgency, DAY_MILLIS, DUE_SOON_WINDOW_MILLIS,
};

/// Whole days from `from` to `to`, truncated toward zero
pub fn days_between(from: Timestamp, to: Timestamp) -> i64 {
    (to - from) / DAY_MILLIS
}

pub fn is_past_due(borrowing: &Borrowing, now: Timestamp) -> bool {
    borrowing.due_date < now
}

/// Active loan whose stored status lags behind its due date
pub fn needs_overdue_mark(borrowing: &Borrowing, now: Timestamp) -> bool {
    borrowing.status == BorrowingStatus::Active && is_past_due(borrowing, now)
}

/// Copy of the borrowing with the status it has at `now`
pub fn with_current_status(borrowing: &Borrowing, now: Timestamp) -> Borrowing {
    match borrowing.status.after_due_date() {
        Some(next) if is_past_due(borrowing, now) => Borrowing {
            status: next,
            ..borrowing.clone()
        },
        _ => borrowing.clone(),
    }
}

pub fn days_overdue(borrowing: &Borrowing, now: Timestamp) -> i64 {
    days_between(borrowing.due_date, now)
}

fn is_currently_overdue(borrowing: &Borrowing, now: Timestamp) -> bool {
    borrowing.status == BorrowingStatus::Overdue || needs_overdue_mark(borrowing, now)
}

pub fn currently_overdue_count(borrowings: &[Borrowing], now: Timestamp) -> usize {
    borrowings
        .iter()
        .filter(|borrowing| is_currently_overdue(borrowing, now))
        .count()
}

/// Loans overdue right now, latest due date first
pub fn currently_overdue(borrowings: &[Borrowing], now: Timestamp) -> Vec<Borrowing> {
    let mut overdue: Vec<Borrowing> = borrowings
        .iter()
        .filter(|borrowing| is_currently_overdue(borrowing, now))
        .map(|borrowing| with_current_status(borrowing, now))
        .collect();
    overdue.sort_by_key(|borrowing| Reverse(borrowing.due_date));
    overdue
}

/// Everything that is or was late, latest due date first
pub fn lateness_history(borrowings: &[Borrowing], now: Timestamp) -> Vec<Borrowing> {
    let mut history: Vec<Borrowing> = borrowings
        .iter()
        .filter(|borrowing| {
            borrowing.status == BorrowingStatus::ReturnedLate
                || is_currently_overdue(borrowing, now)
        })
        .map(|borrowing| with_current_status(borrowing, now))
        .collect();
    history.sort_by_key(|borrowing| Reverse(borrowing.due_date));
    history
}

/// Late returns, most recently returned first
pub fn returned_late(borrowings: &[Borrowing]) -> Vec<Borrowing> {
    let mut returned: Vec<Borrowing> = borrowings
        .iter()
        .filter(|borrowing| borrowing.status == BorrowingStatus::ReturnedLate)
        .cloned()
        .collect();
    returned.sort_by_key(|borrowing| Reverse(borrowing.return_date.unwrap_or(borrowing.due_date)));
    returned
}

pub fn urgency(borrowing: &Borrowing, now: Timestamp) -> Urgency {
    if borrowing.due_date < now {
        Urgency::Overdue
    } else if borrowing.due_date <= now + DUE_SOON_WINDOW_MILLIS {
        Urgency::DueSoon
    } else {
        Urgency::OnTrack
    }
}

pub fn notification(borrowing: &Borrowing, now: Timestamp) -> Notification {
    let urgency = urgency(borrowing, now);
    let days = match urgency {
        Urgency::Overdue => days_between(borrowing.due_date, now),
        Urgency::DueSoon | Urgency::OnTrack => days_between(now, borrowing.due_date),
    };
    Notification {
        borrowing: with_current_status(borrowing, now),
        urgency,
        days,
    }
}

/// Reminders for every open loan, soonest due date first
pub fn notifications(borrowings: &[Borrowing], now: Timestamp) -> Vec<Notification> {
    let mut open: Vec<&Borrowing> = borrowings
        .iter()
        .filter(|borrowing| borrowing.status.is_open())
        .collect();
    open.sort_by_key(|borrowing| borrowing.due_date);
    open.into_iter()
        .map(|borrowing| notification(borrowing, now))
        .collect()
}

pub fn lateness_record(borrowing: &Borrowing, now: Timestamp) -> LatenessRecord {
    let current = with_current_status(borrowing, now);
    let days_late = match (current.status, current.return_date) {
        (BorrowingStatus::Overdue, _) => Some(days_between(current.due_date, now)),
        (BorrowingStatus::ReturnedLate, Some(returned_at)) if returned_at > 0 => {
            Some(days_between(current.due_date, returned_at))
        }
        _ => None,
    };
    LatenessRecord {
        borrowing: current,
        days_late,
    }
}

fn sort_newest_first(borrowings: &mut [Borrowing]) {
    borrowings.sort_by_key(|borrowing| Reverse(borrowing.borrow_date));
}

/// Borrowings in the given status (all when `None`), newest loan first
pub fn filter_by_status(
    borrowings: &[Borrowing],
    status: Option<BorrowingStatus>,
    now: Timestamp,
) -> Vec<Borrowing> {
    let mut selected: Vec<Borrowing> = borrowings
        .iter()
        .map(|borrowing| with_current_status(borrowing, now))
        .filter(|borrowing| status.map_or(true, |status| borrowing.status == status))
        .collect();
    sort_newest_first(&mut selected);
    selected
}

/// Case-insensitive match on borrower name, NIM, class and book title, newest loan first
pub fn search_borrowings(borrowings: &[Borrowing], query: &str, now: Timestamp) -> Vec<Borrowing> {
    let query = query.trim().to_lowercase();
    let mut found: Vec<Borrowing> = borrowings
        .iter()
        .filter(|borrowing| {
            query.is_empty()
                || [
                    &borrowing.borrower_name,
                    &borrowing.borrower_nim,
                    &borrowing.borrower_class,
                    &borrowing.book_title,
                ]
                .iter()
                .any(|field| field.to_lowercase().contains(&query))
        })
        .map(|borrowing| with_current_status(borrowing, now))
        .collect();
    sort_newest_first(&mut found);
    found
}

/// Midnight UTC of the first day of the month containing `now`
pub fn start_of_month(now: Timestamp) -> Timestamp {
    DateTime::<Utc>::from_timestamp_millis(now)
        .and_then(|moment| moment.date_naive().with_day(1))
        .and_then(|first_day| first_day.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp_millis())
        .unwrap_or(now)
}

pub fn library_statistics(
    books: &[Book],
    borrowings: &[Borrowing],
    now: Timestamp,
) -> LibraryStatistics {
    let month_start = start_of_month(now);
    LibraryStatistics {
        total_books: books.len(),
        total_stock: books.iter().map(|book| u64::from(book.stock)).sum(),
        active_borrowings: borrowings
            .iter()
            .filter(|borrowing| {
                borrowing.status == BorrowingStatus::Active && !is_past_due(borrowing, now)
            })
            .count(),
        overdue_borrowings: currently_overdue_count(borrowings, now),
        monthly_borrowings: borrowings
            .iter()
            .filter(|borrowing| borrowing.borrow_date >= month_start)
            .count(),
    }
}
