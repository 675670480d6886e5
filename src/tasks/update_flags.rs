use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::model::Model;
use crate::parser::{Command, StoreMode};
use crate::types::{Flag, MailboxId, Sequence, StateKind, StateResponse, Tag, TaskId, Uid};

/// `UID STORE` of some flags, applied to the tree once the server agrees.
///
/// The command is silent, so the server does not echo the new flags; the task computes them
/// from the flags the messages had when the tagged `OK` arrived.
#[derive(Debug)]
pub(crate) struct UpdateFlagsTask {
    mailbox: MailboxId,
    uids: Vec<Uid>,
    mode: StoreMode,
    flags: Vec<Flag<'static>>,
    tag: Option<Tag>,
}

impl UpdateFlagsTask {
    pub(crate) fn new(
        mailbox: MailboxId,
        uids: Vec<Uid>,
        mode: StoreMode,
        flags: Vec<Flag<'static>>,
    ) -> Self {
        UpdateFlagsTask {
            mailbox,
            uids,
            mode,
            flags,
            tag: None,
        }
    }

    fn apply(&self, model: &mut Model) {
        let name = match model.tree.name(self.mailbox) {
            Some(name) => name,
            None => return,
        };
        for &uid in &self.uids {
            let (offset, mut flags) = match model.tree.message_by_uid(self.mailbox, uid) {
                Some((offset, m)) => (offset, m.flags().to_vec()),
                None => continue,
            };
            match self.mode {
                StoreMode::Add => Flag::add_all(&mut flags, &self.flags),
                StoreMode::Remove => Flag::remove_all(&mut flags, &self.flags),
                StoreMode::Replace => flags = self.flags.clone(),
            }
            model.cache.set_msg_flags(&name, uid, &flags);
            model.tree.set_flags(self.mailbox, offset, flags);
        }
    }
}

impl ImapTask for UpdateFlagsTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox disappeared");
            return Ok(());
        }
        self.uids
            .retain(|&uid| model.tree.message_by_uid(self.mailbox, uid).is_some());
        let sequence = match Sequence::from_list(self.uids.iter().copied()) {
            Some(sequence) => sequence,
            None => {
                model.task_failed(
                    me,
                    "All messages got removed before we could've updated their flags",
                );
                return Ok(());
            }
        };
        let conn = model.conn_of(me)?;
        self.tag = Some(model.send(
            conn,
            Command::UidStore {
                sequence,
                mode: self.mode,
                silent: true,
                flags: self.flags.clone(),
            },
        )?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind == StateKind::Ok {
            self.apply(model);
            model.task_completed(me);
        } else {
            model.task_failed(me, "Failed to update FLAGS");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::model::Model;
    use crate::parser::StoreMode;
    use crate::testing::{synchronize, ScriptedConnector};
    use crate::types::{Flag, TaskState};

    fn opened() -> (ScriptedConnector, Model) {
        let connector =
            ScriptedConnector::new().with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n");
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.open_mailbox("INBOX").unwrap();
        m.poll();
        synchronize(&mut m, &connector.connection(0), &[4, 5, 6]);
        (connector, m)
    }

    #[test]
    fn flags_change_after_ok() {
        let (connector, mut m) = opened();
        let h = connector.connection(0);
        let task = m
            .update_flags("INBOX", vec![4, 6], StoreMode::Add, vec![Flag::Seen])
            .unwrap();
        assert_eq!(
            h.sent_lines().last().map(String::as_str),
            Some("UID STORE 4,6 +FLAGS.SILENT (\\Seen)")
        );
        let inbox = m.tree().find("INBOX").unwrap();
        assert!(m.tree().messages(inbox)[0].flags().is_empty());

        h.server(&format!("{} OK stored\r\n", h.tag_of("UID STORE")));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let msgs = m.tree().messages(inbox);
        assert_eq!(msgs[0].flags(), &[Flag::Seen]);
        assert!(msgs[1].flags().is_empty());
        assert_eq!(msgs[2].flags(), &[Flag::Seen]);
        assert_eq!(m.cache().msg_flags("INBOX", 6), Some(vec![Flag::Seen]));
    }

    #[test]
    fn refused_store_leaves_flags() {
        let (connector, mut m) = opened();
        let h = connector.connection(0);
        let task = m
            .update_flags("INBOX", vec![5], StoreMode::Replace, vec![Flag::Flagged])
            .unwrap();
        h.server(&format!("{} NO read-only\r\n", h.tag_of("UID STORE")));
        m.poll();
        assert_eq!(m.task_failure(task), Some("Failed to update FLAGS"));
        let inbox = m.tree().find("INBOX").unwrap();
        assert!(m.tree().messages(inbox)[1].flags().is_empty());
    }

    #[test]
    fn vanished_messages_are_a_local_failure() {
        let (connector, mut m) = opened();
        let h = connector.connection(0);
        let task = m
            .update_flags("INBOX", vec![77, 78], StoreMode::Add, vec![Flag::Seen])
            .unwrap();
        assert_eq!(
            m.task_failure(task),
            Some("All messages got removed before we could've updated their flags")
        );
        assert!(h.sent_lines().iter().all(|l| !l.starts_with("UID STORE")));
    }
}
