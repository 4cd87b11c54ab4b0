//! Shared context types

use crate::classify::ContextKind;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Active,
    Completed,
}

/// Read-only snapshot of one logical acquisition unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionGroup {
    pub group_id: String,
    /// Members in the context's ordering (arrival, or timestamp for FIB)
    pub ordered_members: Vec<PathBuf>,
    pub state: GroupState,
    /// Size announced by acquisition metadata, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<usize>,
}

impl AcquisitionGroup {
    pub fn is_completed(&self) -> bool {
        self.state == GroupState::Completed
    }
}

/// A group reported complete by a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub context: ContextKind,
    pub group_id: String,
}

/// Insertion-ordered group bookkeeping shared by the contexts.
#[derive(Debug, Default)]
pub(crate) struct GroupTable {
    groups: Vec<GroupEntry>,
}

#[derive(Debug)]
pub(crate) struct GroupEntry {
    pub id: String,
    pub members: Vec<PathBuf>,
    pub completed: bool,
}

impl GroupTable {
    pub fn get(&self, id: &str) -> Option<&GroupEntry> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut GroupEntry> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    /// Existing entry for `id`, or a new one appended in first-seen order.
    /// The flag is true when the entry was created.
    pub fn entry(&mut self, id: &str) -> (&mut GroupEntry, bool) {
        match self.groups.iter().position(|g| g.id == id) {
            Some(idx) => (&mut self.groups[idx], false),
            None => {
                self.groups.push(GroupEntry {
                    id: id.to_string(),
                    members: Vec::new(),
                    completed: false,
                });
                let last = self.groups.len() - 1;
                (&mut self.groups[last], true)
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupEntry> {
        self.groups.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GroupEntry> {
        self.groups.iter_mut()
    }

    pub fn snapshot(&self, expected: impl Fn(&str) -> Option<usize>) -> Vec<AcquisitionGroup> {
        self.groups
            .iter()
            .map(|g| AcquisitionGroup {
                group_id: g.id.clone(),
                ordered_members: g.members.clone(),
                state: if g.completed {
                    GroupState::Completed
                } else {
                    GroupState::Active
                },
                expected_size: expected(&g.id),
            })
            .collect()
    }
}
