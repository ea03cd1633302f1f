use crate::scene::FieldId;
use std::collections::{BTreeSet, HashMap};

/// A relation received by name whose target was not alive locally yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingRelation {
    pub subject: String,
    pub field: FieldId,
    pub target: String,
}

/// Relations waiting for their target entity to be created.
///
/// Each `(subject, field)` pair waits on at most one target. Queuing a new
/// target for the same pair replaces the old one, so a later delta always
/// wins over an earlier unresolved one.
#[derive(Debug, Default)]
pub struct RelationWaitlist {
    waiting_on_target: HashMap<String, BTreeSet<(String, FieldId)>>,
    target_of: HashMap<(String, FieldId), String>,
}

impl RelationWaitlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, subject: &str, field: FieldId, target: &str) {
        self.cancel(subject, field);
        self.waiting_on_target
            .entry(target.to_string())
            .or_default()
            .insert((subject.to_string(), field));
        self.target_of
            .insert((subject.to_string(), field), target.to_string());
    }

    /// Drops the pending relation of `(subject, field)`, returning the target
    /// it was waiting on.
    pub fn cancel(&mut self, subject: &str, field: FieldId) -> Option<String> {
        let target = self.target_of.remove(&(subject.to_string(), field))?;
        let mut emptied = false;
        if let Some(waiting) = self.waiting_on_target.get_mut(&target) {
            waiting.remove(&(subject.to_string(), field));
            emptied = waiting.is_empty();
        }
        if emptied {
            self.waiting_on_target.remove(&target);
        }
        Some(target)
    }

    /// Removes every relation whose subject is `subject`.
    pub fn forget_subject(&mut self, subject: &str) {
        let fields: Vec<FieldId> = self
            .target_of
            .keys()
            .filter(|(pending, _)| pending == subject)
            .map(|(_, field)| *field)
            .collect();
        for field in fields {
            self.cancel(subject, field);
        }
    }

    /// Hands out, and removes, every relation waiting on `target`.
    pub fn take_waiting_on(&mut self, target: &str) -> Vec<PendingRelation> {
        let Some(waiting) = self.waiting_on_target.remove(target) else {
            return Vec::new();
        };
        waiting
            .into_iter()
            .map(|(subject, field)| {
                self.target_of.remove(&(subject.clone(), field));
                PendingRelation {
                    subject,
                    field,
                    target: target.to_string(),
                }
            })
            .collect()
    }

    pub fn target_of(&self, subject: &str, field: FieldId) -> Option<&str> {
        self.target_of
            .get(&(subject.to_string(), field))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.target_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target_of.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_all_subjects_waiting_on_a_target() {
        let mut waitlist = RelationWaitlist::new();
        waitlist.queue("cyl1", FieldId::PARENT_NODE, "room1");
        waitlist.queue("lamp", FieldId::PARENT_NODE, "room1");
        waitlist.queue("cyl1", FieldId::MATERIAL, "stone");

        let ready = waitlist.take_waiting_on("room1");
        let subjects: Vec<&str> = ready.iter().map(|p| p.subject.as_str()).collect();
        assert_eq!(subjects, vec!["cyl1", "lamp"]);
        assert_eq!(waitlist.len(), 1);
        assert!(waitlist.take_waiting_on("room1").is_empty());
    }

    #[test]
    fn requeue_replaces_previous_target() {
        let mut waitlist = RelationWaitlist::new();
        waitlist.queue("cyl1", FieldId::PARENT_NODE, "room1");
        waitlist.queue("cyl1", FieldId::PARENT_NODE, "room2");

        assert!(waitlist.take_waiting_on("room1").is_empty());
        assert_eq!(waitlist.target_of("cyl1", FieldId::PARENT_NODE), Some("room2"));
        assert_eq!(waitlist.len(), 1);
    }

    #[test]
    fn forgetting_a_subject_clears_all_its_fields() {
        let mut waitlist = RelationWaitlist::new();
        waitlist.queue("cyl1", FieldId::PARENT_NODE, "room1");
        waitlist.queue("cyl1", FieldId::MATERIAL, "stone");
        waitlist.queue("lamp", FieldId::PARENT_NODE, "room1");

        waitlist.forget_subject("cyl1");

        assert_eq!(waitlist.len(), 1);
        assert!(waitlist.take_waiting_on("stone").is_empty());
        assert_eq!(waitlist.take_waiting_on("room1").len(), 1);
        assert!(waitlist.is_empty());
    }
}
