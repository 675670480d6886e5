use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{MailboxId, Sequence, StateKind, StateResponse, Tag, TaskId, Uid};

/// `EXPUNGE` of the selected mailbox.
///
/// The untagged `EXPUNGE` responses are applied by the owner of the mailbox as they arrive.
#[derive(Debug)]
pub(crate) struct ExpungeMailboxTask {
    mailbox: MailboxId,
    tag: Option<Tag>,
}

impl ExpungeMailboxTask {
    pub(crate) fn new(mailbox: MailboxId) -> Self {
        ExpungeMailboxTask { mailbox, tag: None }
    }
}

impl ImapTask for ExpungeMailboxTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox disappeared");
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        self.tag = Some(model.send(conn, Command::Expunge)?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind == StateKind::Ok {
            model.task_completed(me);
        } else {
            model.task_failed(me, "EXPUNGE failed");
        }
        Ok(true)
    }
}

/// `UID EXPUNGE` ([RFC 4315](https://tools.ietf.org/html/rfc4315)) of some messages.
#[derive(Debug)]
pub(crate) struct ExpungeMessagesTask {
    mailbox: MailboxId,
    uids: Vec<Uid>,
    tag: Option<Tag>,
}

impl ExpungeMessagesTask {
    pub(crate) fn new(mailbox: MailboxId, uids: Vec<Uid>) -> Self {
        ExpungeMessagesTask {
            mailbox,
            uids,
            tag: None,
        }
    }
}

impl ImapTask for ExpungeMessagesTask {
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
                model.task_failed(me, "All messages are gone already");
                return Ok(());
            }
        };
        let conn = model.conn_of(me)?;
        if !model.has_capability(conn, "UIDPLUS") {
            model.task_failed(me, "The IMAP server doesn't support the UIDPLUS extension");
            return Ok(());
        }
        self.tag = Some(model.send(conn, Command::UidExpunge(sequence))?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind == StateKind::Ok {
            model.task_completed(me);
        } else {
            model.task_failed(me, "UID EXPUNGE failed");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::model::Model;
    use crate::testing::{synchronize, ScriptedConnector};
    use crate::types::TaskState;

    fn opened(caps: &str) -> (ScriptedConnector, Model) {
        let connector = ScriptedConnector::new()
            .with_greeting(&format!("* PREAUTH [CAPABILITY IMAP4rev1{}] hi\r\n", caps));
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.open_mailbox("INBOX").unwrap();
        m.poll();
        synchronize(&mut m, &connector.connection(0), &[1, 2, 3, 4]);
        (connector, m)
    }

    #[test]
    fn expunge_removes_what_the_server_reports() {
        let (connector, mut m) = opened("");
        let h = connector.connection(0);
        let task = m.expunge_mailbox("INBOX").unwrap();
        h.server(&format!(
            "* 2 EXPUNGE\r\n* 2 EXPUNGE\r\n{} OK expunged\r\n",
            h.tag_of("EXPUNGE")
        ));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let inbox = m.tree().find("INBOX").unwrap();
        assert_eq!(m.tree().uids(inbox), vec![1, 4]);
        assert_eq!(m.cache().uid_mapping("INBOX"), vec![1, 4]);
    }

    #[test]
    fn uid_expunge_needs_uidplus() {
        let (connector, mut m) = opened("");
        let h = connector.connection(0);
        let task = m.expunge_messages("INBOX", vec![2]).unwrap();
        assert_eq!(
            m.task_failure(task),
            Some("The IMAP server doesn't support the UIDPLUS extension")
        );
        assert!(h.sent_lines().iter().all(|l| !l.starts_with("UID EXPUNGE")));
    }

    #[test]
    fn uid_expunge_of_known_messages() {
        let (connector, mut m) = opened(" UIDPLUS");
        let h = connector.connection(0);
        let task = m.expunge_messages("INBOX", vec![2, 3, 50]).unwrap();
        assert_eq!(h.sent_lines().last().map(String::as_str), Some("UID EXPUNGE 2:3"));
        h.server(&format!("{} NO busy\r\n", h.tag_of("UID EXPUNGE")));
        m.poll();
        assert_eq!(m.task_failure(task), Some("UID EXPUNGE failed"));
    }
}
