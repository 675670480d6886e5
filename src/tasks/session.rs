//! One-shot commands which configure the session: `ID` and `ENABLE`.

use std::collections::BTreeMap;

use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{StateKind, StateResponse, Tag, TaskId};

/// Tell the server who we are, [RFC 2971](https://tools.ietf.org/html/rfc2971).
///
/// What the server says about itself is stored on the connection.
#[derive(Debug)]
pub(crate) struct IdTask {
    fields: Vec<(String, String)>,
    tag: Option<Tag>,
}

impl IdTask {
    pub(crate) fn new(fields: Vec<(String, String)>) -> Self {
        IdTask { fields, tag: None }
    }
}

impl ImapTask for IdTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        self.tag = Some(model.send(conn, Command::Id(self.fields.clone()))?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind == StateKind::Ok {
            model.task_completed(me);
        } else {
            model.task_failed(me, "ID failed, strange");
        }
        Ok(true)
    }

    fn handle_id(
        &mut self,
        model: &mut Model,
        me: TaskId,
        data: &Option<BTreeMap<String, String>>,
    ) -> Result<bool> {
        let conn = model.conn_of(me)?;
        log::debug!("{}: server identifies as {:?}", conn, data);
        if let Some(c) = model.conn_mut(conn) {
            c.server_id = data.clone();
        }
        Ok(true)
    }
}

/// Switch on extensions, [RFC 5161](https://tools.ietf.org/html/rfc5161).
#[derive(Debug)]
pub(crate) struct EnableTask {
    extensions: Vec<String>,
    tag: Option<Tag>,
}

impl EnableTask {
    pub(crate) fn new(extensions: Vec<String>) -> Self {
        EnableTask {
            extensions,
            tag: None,
        }
    }
}

impl ImapTask for EnableTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        self.tag = Some(model.send(conn, Command::Enable(self.extensions.clone()))?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind == StateKind::Ok {
            model.task_completed(me);
        } else {
            model.task_failed(me, &format!("ENABLE failed: {}", resp.message));
        }
        Ok(true)
    }

    fn handle_enabled(&mut self, model: &mut Model, me: TaskId, caps: &[String]) -> Result<bool> {
        let conn = model.conn_of(me)?;
        if let Some(c) = model.conn_mut(conn) {
            for cap in caps {
                if !c.enabled.iter().any(|e| e.eq_ignore_ascii_case(cap)) {
                    c.enabled.push(cap.clone());
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::model::Model;
    use crate::testing::ScriptedConnector;
    use crate::types::TaskState;

    fn authenticated() -> (ScriptedConnector, Model) {
        let connector =
            ScriptedConnector::new().with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n");
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.get_any_connection().unwrap();
        m.poll();
        (connector, m)
    }

    #[test]
    fn id_stores_server_identification() {
        let (connector, mut m) = authenticated();
        let task = m.id().unwrap();
        let h = connector.connection(0);
        let tag = h.tag_of("ID");
        h.server(&format!("* ID (\"name\" \"Dovecot\")\r\n{} OK done\r\n", tag));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let conn = m.connections().next().unwrap();
        assert_eq!(
            conn.server_id().and_then(|id| id.get("name")).map(String::as_str),
            Some("Dovecot")
        );
    }

    #[test]
    fn enable_records_extensions() {
        let (connector, mut m) = authenticated();
        let task = m.enable(vec!["QRESYNC".to_string()]).unwrap();
        let h = connector.connection(0);
        let tag = h.tag_of("ENABLE");
        h.server(&format!("* ENABLED QRESYNC\r\n{} OK enabled\r\n", tag));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        assert_eq!(m.connections().next().unwrap().enabled(), ["QRESYNC".to_string()]);
    }

    #[test]
    fn enable_failure_is_reported() {
        let (connector, mut m) = authenticated();
        let task = m.enable(vec!["FOO".to_string()]).unwrap();
        let h = connector.connection(0);
        h.server(&format!("{} BAD unknown\r\n", h.tag_of("ENABLE")));
        m.poll();
        assert_eq!(m.task_failure(task), Some("ENABLE failed: unknown"));
    }
}
