//! Event query types for inspection and operator tooling.

use serde::{Deserialize, Serialize};

use courier_core::{Event, EventStatus};

/// Default page size.
pub const DEFAULT_LIMIT: u32 = 50;

/// Largest page a caller may request.
pub const MAX_LIMIT: u32 = 500;

/// Pagination parameters for event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of events to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for event queries. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub event_type: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        self.status.is_none_or(|s| s == event.status)
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| t == event.event_type.as_str())
    }
}

/// Paginated query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Number of events matching the filter (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl EventPage {
    pub fn new(events: Vec<Event>, total: u64, pagination: Pagination) -> Self {
        let has_more = total > u64::from(pagination.offset) + events.len() as u64;
        Self {
            events,
            total,
            pagination,
            has_more,
        }
    }
}

/// Number of events per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: EventStatus, n: u64) {
        let slot = match status {
            EventStatus::Pending => &mut self.pending,
            EventStatus::Processing => &mut self.processing,
            EventStatus::Processed => &mut self.processed,
            EventStatus::Failed => &mut self.failed,
            EventStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += n;
    }

    pub fn get(&self, status: EventStatus) -> u64 {
        match status {
            EventStatus::Pending => self.pending,
            EventStatus::Processing => self.processing,
            EventStatus::Processed => self.processed,
            EventStatus::Failed => self.failed,
            EventStatus::DeadLetter => self.dead_letter,
        }
    }

    pub fn total(&self) -> u64 {
        EventStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_is_clamped() {
        assert_eq!(Pagination::new(None, None), Pagination::default());
        assert_eq!(Pagination::new(Some(10_000), None).limit, MAX_LIMIT);
        assert_eq!(Pagination::new(Some(0), Some(7)).limit, 1);
        assert_eq!(Pagination::new(Some(0), Some(7)).offset, 7);
    }

    #[test]
    fn page_reports_more_results() {
        let pagination = Pagination::new(Some(2), Some(0));
        let page = EventPage::new(Vec::new(), 5, pagination);
        assert!(page.has_more);

        let last = EventPage::new(Vec::new(), 0, pagination);
        assert!(!last.has_more);
    }

    #[test]
    fn counts_sum_to_total() {
        let mut counts = StatusCounts::default();
        counts.add(EventStatus::Pending, 2);
        counts.add(EventStatus::DeadLetter, 1);
        assert_eq!(counts.get(EventStatus::Pending), 2);
        assert_eq!(counts.total(), 3);
    }
}
