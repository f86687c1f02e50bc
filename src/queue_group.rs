//! `QueueGroup`: an ordered, comma-separated list of queue names used as a
//! single opaque map key, per spec.md 3. DATA MODEL.

use std::fmt;

/// An ordered comma-separated queue-name list, used as an opaque key for
/// grouping workers. Two groups with equal string form are identical; order
/// within the string is preserved for worker creation (the list is handed to
/// the worker as-is, queues first-to-last).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueGroup(String);

impl QueueGroup {
    /// Builds a group from its raw, already comma-joined display form.
    pub fn new(raw: impl Into<String>) -> Self {
        QueueGroup(raw.into())
    }

    /// The queue names in declaration order. Never canonicalized: callers
    /// may rely on display order in logs and in the order workers are told
    /// to poll their queues.
    pub fn queues(&self) -> Vec<&str> {
        self.0.split(',').map(str::trim).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for QueueGroup {
    fn from(value: String) -> Self {
        QueueGroup(value)
    }
}

impl From<&str> for QueueGroup {
    fn from(value: &str) -> Self {
        QueueGroup(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_comma_preserving_order() {
        let group = QueueGroup::new("high,medium,low");
        assert_eq!(group.queues(), vec!["high", "medium", "low"]);
    }

    #[test]
    fn single_queue_has_no_split() {
        let group = QueueGroup::new("default");
        assert_eq!(group.queues(), vec!["default"]);
    }

    #[test]
    fn equal_string_form_is_equal_key() {
        let a = QueueGroup::new("high,low");
        let b = QueueGroup::from("high,low".to_string());
        assert_eq!(a, b);
    }
}
