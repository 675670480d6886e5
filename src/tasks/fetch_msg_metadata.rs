use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::tree::FetchState;
use crate::types::{
    ConnectionState, FetchResponse, MailboxId, Sequence, StateKind, StateResponse, Tag, TaskId,
    Uid,
};

/// Downloads envelopes, sizes, internal dates and body structures of some messages.
///
/// The untagged `FETCH` data is applied to the tree by whoever claims it (normally the owner of
/// the mailbox); this task only decides what happens to messages the server said nothing about.
#[derive(Debug)]
pub(crate) struct FetchMsgMetadataTask {
    mailbox: MailboxId,
    uids: Vec<Uid>,
    tag: Option<Tag>,
}

impl FetchMsgMetadataTask {
    pub(crate) fn new(mailbox: MailboxId, uids: Vec<Uid>) -> Self {
        FetchMsgMetadataTask {
            mailbox,
            uids,
            tag: None,
        }
    }

    fn mark(&self, model: &mut Model, from: Option<FetchState>, to: FetchState) {
        for &uid in &self.uids {
            let found = model
                .tree
                .message_by_uid(self.mailbox, uid)
                .map(|(offset, m)| (offset, m.metadata_state()));
            if let Some((offset, state)) = found {
                if from.map(|f| f == state).unwrap_or(state != FetchState::Done) {
                    model.tree.set_metadata_state(self.mailbox, offset, to);
                }
            }
        }
    }
}

impl ImapTask for FetchMsgMetadataTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            self.mark(model, Some(FetchState::Loading), FetchState::Unavailable);
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
        self.mark(model, None, FetchState::Loading);
        let conn = model.conn_of(me)?;
        model.set_conn_state(conn, ConnectionState::FetchingMsgMetadata);
        self.tag = Some(model.send(
            conn,
            Command::UidFetch {
                sequence,
                items: vec![
                    "ENVELOPE".to_string(),
                    "INTERNALDATE".to_string(),
                    "BODYSTRUCTURE".to_string(),
                    "RFC822.SIZE".to_string(),
                ],
            },
        )?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        let conn = model.conn_of(me)?;
        model.set_conn_state(conn, ConnectionState::Selected);
        // whatever did not arrive by now is not going to
        self.mark(model, Some(FetchState::Loading), FetchState::Unavailable);
        if resp.kind == StateKind::Ok {
            model.task_completed(me);
        } else {
            model.task_failed(me, "UID FETCH failed");
        }
        Ok(true)
    }

    fn handle_fetch(&mut self, model: &mut Model, me: TaskId, resp: &FetchResponse) -> Result<bool> {
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "handleFetch: mailbox disappeared");
            return Ok(false);
        }
        model
            .tree
            .handle_fetch(self.mailbox, resp, model.cache.as_mut())?;
        Ok(true)
    }

    fn die(&mut self, model: &mut Model, me: TaskId, reason: &str) {
        self.mark(model, Some(FetchState::Loading), FetchState::Unavailable);
        model.task_failed(me, reason);
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::model::Model;
    use crate::testing::{synchronize, ScriptedConnector};
    use crate::tree::FetchState;
    use crate::types::TaskState;

    fn opened() -> (ScriptedConnector, Model) {
        let connector =
            ScriptedConnector::new().with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n");
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.open_mailbox("INBOX").unwrap();
        m.poll();
        synchronize(&mut m, &connector.connection(0), &[3, 5, 9]);
        (connector, m)
    }

    #[test]
    fn metadata_lands_in_tree_and_cache() {
        let (connector, mut m) = opened();
        let h = connector.connection(0);
        let task = m.fetch_message_metadata("INBOX", vec![5]).unwrap();
        assert_eq!(
            h.sent_lines().last().map(String::as_str),
            Some("UID FETCH 5 (ENVELOPE INTERNALDATE BODYSTRUCTURE RFC822.SIZE)")
        );
        let inbox = m.tree().find("INBOX").unwrap();
        assert_eq!(m.tree().messages(inbox)[1].metadata_state(), FetchState::Loading);

        let tag = h.tag_of("UID FETCH 5");
        h.server(&format!(
            "* 2 FETCH (UID 5 RFC822.SIZE 2003 INTERNALDATE \"17-Jul-1996 02:44:25 -0700\" \
             ENVELOPE (\"Wed, 17 Jul 1996 02:23:25 -0700 (PDT)\" \"Subject\" NIL NIL NIL NIL NIL NIL NIL \"<id@host>\") \
             BODYSTRUCTURE (\"TEXT\" \"PLAIN\" (\"CHARSET\" \"US-ASCII\") NIL NIL \"7BIT\" 3028 92))\r\n\
             {} OK done\r\n",
            tag
        ));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let msg = &m.tree().messages(inbox)[1];
        assert_eq!(msg.metadata_state(), FetchState::Done);
        assert_eq!(msg.metadata().and_then(|md| md.size), Some(2003));
        assert!(m.cache().message_metadata("INBOX", 5).is_some());
    }

    #[test]
    fn silence_makes_metadata_unavailable() {
        let (connector, mut m) = opened();
        let h = connector.connection(0);
        let task = m.fetch_message_metadata("INBOX", vec![3, 9]).unwrap();
        let tag = h.tag_of("UID FETCH 3,9");
        h.server(&format!("{} NO nope\r\n", tag));
        m.poll();
        assert_eq!(m.task_failure(task), Some("UID FETCH failed"));
        let inbox = m.tree().find("INBOX").unwrap();
        assert_eq!(m.tree().messages(inbox)[0].metadata_state(), FetchState::Unavailable);
        assert_eq!(m.tree().messages(inbox)[2].metadata_state(), FetchState::Unavailable);
    }

    #[test]
    fn unknown_uids_are_not_sent() {
        let (connector, mut m) = opened();
        let h = connector.connection(0);
        h.take_lines();
        let task = m.fetch_message_metadata("INBOX", vec![100]).unwrap();
        assert_eq!(m.task_failure(task), Some("All messages are gone already"));
        assert!(h.sent_lines().iter().all(|l| !l.starts_with("UID FETCH")));
    }
}
