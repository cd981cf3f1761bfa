//! Visit statistics shared by states, actions, transitions and activities

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitStats {
    pub first: Option<u64>,
    pub last: Option<u64>,
    pub count: u32,
}

impl VisitStats {
    pub fn visited_at(&mut self, timestamp: u64) {
        if self.first.is_none() {
            self.first = Some(timestamp);
        }
        self.last = Some(timestamp);
        self.count += 1;
    }

    pub fn is_visited(&self) -> bool {
        self.first.is_some()
    }

    pub fn is_unvisited(&self) -> bool {
        self.first.is_none()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Ascending by last visit, never-visited first
    pub fn cmp_last_visit(&self, other: &Self) -> Ordering {
        match (self.last, other.last) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visited_at() {
        let mut stats = VisitStats::default();
        assert!(stats.is_unvisited());
        stats.visited_at(4);
        stats.visited_at(9);
        assert_eq!(stats.first, Some(4));
        assert_eq!(stats.last, Some(9));
        assert_eq!(stats.count, 2);
    }

    #[test]
    fn test_unvisited_sorts_first() {
        let mut seen = VisitStats::default();
        seen.visited_at(1);
        assert_eq!(VisitStats::default().cmp_last_visit(&seen), Ordering::Less);
    }
}
