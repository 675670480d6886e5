use chrono::{DateTime, FixedOffset};

use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{Flag, RespCode, StateKind, StateResponse, Tag, TaskId};

/// `APPEND` of a complete message to a mailbox.
#[derive(Debug)]
pub(crate) struct AppendTask {
    mailbox: String,
    message: Vec<u8>,
    flags: Vec<Flag<'static>>,
    internal_date: Option<DateTime<FixedOffset>>,
    tag: Option<Tag>,
}

impl AppendTask {
    pub(crate) fn new(
        mailbox: String,
        message: Vec<u8>,
        flags: Vec<Flag<'static>>,
        internal_date: Option<DateTime<FixedOffset>>,
    ) -> Self {
        AppendTask {
            mailbox,
            message,
            flags,
            internal_date,
            tag: None,
        }
    }
}

impl ImapTask for AppendTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        self.tag = Some(model.send(
            conn,
            Command::Append {
                mailbox: self.mailbox.clone(),
                flags: self.flags.clone(),
                internal_date: self.internal_date,
                message: std::mem::take(&mut self.message),
            },
        )?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind == StateKind::Ok {
            if let Some(RespCode::Other(ref atom, ref arg)) = resp.code {
                log::debug!("{}: appended to {:?}, {} {:?}", me, self.mailbox, atom, arg);
            }
            model.task_completed(me);
        } else {
            model.task_failed(me, &resp.message);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::model::Model;
    use crate::parser::Command;
    use crate::testing::ScriptedConnector;
    use crate::types::{Flag, TaskState};

    fn authenticated() -> (ScriptedConnector, Model) {
        let connector =
            ScriptedConnector::new().with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n");
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.get_any_connection().unwrap();
        m.poll();
        (connector, m)
    }

    #[test]
    fn message_goes_out_as_a_literal() {
        let (connector, mut m) = authenticated();
        let h = connector.connection(0);
        let date = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2020, 3, 7, 10, 0, 0)
            .unwrap();
        let task = m
            .append("Sent", b"Subject: hi\r\n\r\nbody\r\n".to_vec(), vec![Flag::Seen], Some(date))
            .unwrap();
        let (tag, command) = h.sent().pop().unwrap();
        let (line, literal) = command.render().unwrap();
        assert_eq!(line, "APPEND \"Sent\" (\\Seen) \"07-Mar-2020 10:00:00 +0100\" {21}");
        assert_eq!(literal.as_deref(), Some(&b"Subject: hi\r\n\r\nbody\r\n"[..]));
        assert!(matches!(command, Command::Append { .. }));

        h.server(&format!("{} OK [APPENDUID 38505 3955] done\r\n", tag));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
    }

    #[test]
    fn refusal_carries_the_server_text() {
        let (connector, mut m) = authenticated();
        let h = connector.connection(0);
        let task = m.append("Sent", b"x".to_vec(), vec![], None).unwrap();
        h.server(&format!("{} NO [OVERQUOTA] mailbox is full\r\n", h.tag_of("APPEND")));
        m.poll();
        assert_eq!(m.task_failure(task), Some("mailbox is full"));
    }
}
