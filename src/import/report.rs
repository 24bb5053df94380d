use crate::models::ImportIssue;

/// Keeps the first `max_entries` issues and counts the rest.
#[derive(Debug, Default)]
pub struct IssueLog {
    entries: Vec<ImportIssue>,
    max_entries: Option<usize>,
    overflowed: usize,
}

impl IssueLog {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            overflowed: 0,
        }
    }

    pub fn push(&mut self, issue: ImportIssue) {
        if let Some(max) = self.max_entries {
            if self.entries.len() >= max {
                self.overflowed = self.overflowed.saturating_add(1);
                return;
            }
        }
        self.entries.push(issue);
    }

    pub fn total(&self) -> usize {
        self.entries.len() + self.overflowed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn overflowed(&self) -> usize {
        self.overflowed
    }

    pub fn into_entries(self) -> Vec<ImportIssue> {
        self.entries
    }
}
