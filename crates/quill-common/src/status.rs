//! User-visible status messages.
//!
//! Long-running subsystems publish a single current status line per
//! category; operators (and tests) read the latest line to see what the
//! node is doing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Category of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    HistoryPublish,
    HistoryCatchup,
}

/// Holder of the current status message per category.
#[derive(Clone, Default)]
pub struct StatusManager {
    messages: Arc<Mutex<HashMap<StatusCategory, String>>>,
}

impl StatusManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, category: StatusCategory, message: impl Into<String>) {
        self.messages.lock().insert(category, message.into());
    }

    pub fn remove_status(&self, category: StatusCategory) {
        self.messages.lock().remove(&category);
    }

    pub fn status(&self, category: StatusCategory) -> Option<String> {
        self.messages.lock().get(&category).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_remove() {
        let status = StatusManager::new();
        assert!(status.status(StatusCategory::HistoryPublish).is_none());

        status.set_status(StatusCategory::HistoryPublish, "publishing 3 checkpoints");
        assert_eq!(
            status.status(StatusCategory::HistoryPublish).as_deref(),
            Some("publishing 3 checkpoints")
        );

        status.remove_status(StatusCategory::HistoryPublish);
        assert!(status.status(StatusCategory::HistoryPublish).is_none());
    }
}
