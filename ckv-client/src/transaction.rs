//! Transaction sequencer.
//!
//! Collects commands for one `MULTI ... EXEC` block. In cluster mode every
//! key-bearing command must hash to the slot of the first one; a command
//! that does not is rejected when it is added.

use ckv_common::Command;

use crate::command_table;
use crate::error::{ClientResult, RequestError};
use crate::routing::command_slot;

/// Ordered commands for atomic execution on one node.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    commands: Vec<Command>,
    anchor_slot: Option<u16>,
    cluster_mode: bool,
}

impl Transaction {
    /// Empty transaction. `cluster_mode` enables the same-slot check.
    pub fn new(cluster_mode: bool) -> Self {
        Transaction {
            commands: Vec::new(),
            anchor_slot: None,
            cluster_mode,
        }
    }

    /// Queues `cmd`.
    ///
    /// Fails with CROSSSLOT, leaving the transaction unchanged, when the
    /// command's keys span slots or differ from the anchor slot.
    pub fn add(&mut self, cmd: Command) -> ClientResult<&mut Self> {
        if self.cluster_mode {
            let info = command_table::lookup(&cmd);
            if let Some(slot) = command_slot(&cmd, &info)? {
                match self.anchor_slot {
                    None => self.anchor_slot = Some(slot),
                    Some(anchor) if anchor != slot => {
                        return Err(RequestError::cross_slot(command_table::lookup_name(&cmd)).into());
                    }
                    Some(_) => {}
                }
            }
        }
        self.commands.push(cmd);
        Ok(self)
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Slot of the first key-bearing command, if any.
    pub fn anchor_slot(&self) -> Option<u16> {
        self.anchor_slot
    }

    pub fn is_cluster_mode(&self) -> bool {
        self.cluster_mode
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestErrorKind;
    use crate::slot::key_slot;

    fn set(key: &'static str) -> Command {
        Command::new("SET").arg(key).arg("v")
    }

    #[test]
    fn rejects_second_slot_at_add_time() {
        let mut tx = Transaction::new(true);
        tx.add(set("a")).expect("first add anchors");
        assert_eq!(tx.anchor_slot(), Some(key_slot(b"a")));

        let err = tx.add(set("b")).unwrap_err();
        assert_eq!(err.request_kind(), Some(RequestErrorKind::CrossSlot));
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn same_tag_and_keyless_commands_are_accepted() {
        let mut tx = Transaction::new(true);
        tx.add(Command::new("PING")).unwrap();
        assert_eq!(tx.anchor_slot(), None);
        tx.add(set("{user}:name")).unwrap().add(set("{user}:mail")).unwrap();
        tx.add(Command::new("MGET").arg("{user}:name").arg("{user}:mail")).unwrap();
        assert_eq!(tx.len(), 4);
        assert_eq!(tx.anchor_slot(), Some(key_slot(b"user")));
    }

    #[test]
    fn multi_key_command_spanning_slots_is_rejected() {
        let mut tx = Transaction::new(true);
        let err = tx.add(Command::new("MGET").arg("a").arg("b")).unwrap_err();
        assert_eq!(err.request_kind(), Some(RequestErrorKind::CrossSlot));
        assert!(tx.is_empty());
    }

    #[test]
    fn standalone_has_no_slot_constraint() {
        let mut tx = Transaction::new(false);
        tx.add(set("a")).unwrap().add(set("b")).unwrap();
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.anchor_slot(), None);
        assert!(!tx.is_cluster_mode());
    }
}
