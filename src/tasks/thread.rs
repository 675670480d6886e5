use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::extensions::sort::ThreadAlgorithm;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{
    ESearchResponse, Event, MailboxId, StateKind, StateResponse, Tag, TaskId, ThreadNode, Uid,
};

/// `UID THREAD` of the messages matching a search.
///
/// An incremental request asks for `INCTHREAD` through `ESEARCH`
/// ([RFC 5267](https://tools.ietf.org/html/rfc5267)); the answer then only contains the threads
/// which changed, each anchored after the root of an already known thread.
#[derive(Debug)]
pub(crate) struct ThreadTask {
    mailbox: MailboxId,
    algorithm: ThreadAlgorithm,
    search: String,
    incremental: bool,
    tag: Option<Tag>,
    threads: Vec<ThreadNode>,
    updates: Vec<(Uid, Vec<ThreadNode>)>,
}

impl ThreadTask {
    pub(crate) fn new(
        mailbox: MailboxId,
        algorithm: ThreadAlgorithm,
        search: String,
        incremental: bool,
    ) -> Self {
        ThreadTask {
            mailbox,
            algorithm,
            search: if search.is_empty() { "ALL".to_string() } else { search },
            incremental,
            tag: None,
            threads: Vec::new(),
            updates: Vec::new(),
        }
    }
}

impl ImapTask for ThreadTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox disappeared");
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        let capability = self.algorithm.capability();
        if !model.has_capability(conn, &capability) {
            model.task_failed(me, &format!("The IMAP server doesn't support {}", capability));
            return Ok(());
        }
        let algorithm = self.algorithm.clone();
        let charset = "utf-8".to_string();
        let search = self.search.clone();
        if self.incremental && !model.has_capability(conn, "ETHREAD") {
            log::debug!("{}: no ETHREAD, threading everything", me);
            self.incremental = false;
        }
        let command = if self.incremental {
            Command::UidEThread {
                algorithm,
                charset,
                search,
                return_options: vec!["INCTHREAD".to_string()],
            }
        } else {
            Command::UidThread {
                algorithm,
                charset,
                search,
            }
        };
        self.tag = Some(model.send(conn, command)?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind != StateKind::Ok {
            model.task_failed(me, "Threading failed");
            return Ok(true);
        }
        if self.incremental {
            model.emit(Event::ThreadUpdate {
                task: me,
                updates: std::mem::take(&mut self.updates),
            });
        } else {
            model.emit(Event::ThreadResult {
                task: me,
                threads: std::mem::take(&mut self.threads),
            });
        }
        model.task_completed(me);
        Ok(true)
    }

    fn handle_thread(&mut self, _model: &mut Model, _me: TaskId, threads: &[ThreadNode]) -> Result<bool> {
        if self.tag.is_none() || self.incremental {
            return Ok(false);
        }
        self.threads.extend_from_slice(threads);
        Ok(true)
    }

    fn handle_esearch(&mut self, _model: &mut Model, _me: TaskId, resp: &ESearchResponse) -> Result<bool> {
        if !self.incremental || self.tag.is_none() || resp.tag != self.tag {
            return Ok(false);
        }
        self.updates.extend(resp.inc_thread.iter().cloned());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::extensions::sort::ThreadAlgorithm;
    use crate::model::Model;
    use crate::testing::{synchronize, ScriptedConnector};
    use crate::types::{Event, TaskState, ThreadNode};

    fn opened(caps: &str) -> (ScriptedConnector, Model) {
        let connector = ScriptedConnector::new()
            .with_greeting(&format!("* PREAUTH [CAPABILITY IMAP4rev1{}] hi\r\n", caps));
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.open_mailbox("INBOX").unwrap();
        m.poll();
        synchronize(&mut m, &connector.connection(0), &[2, 3, 4, 6]);
        (connector, m)
    }

    fn leaf(id: u32) -> ThreadNode {
        ThreadNode {
            id,
            children: vec![],
        }
    }

    #[test]
    fn threads_arrive_as_one_result() {
        let (connector, mut m) = opened(" THREAD=REFERENCES");
        let h = connector.connection(0);
        let task = m
            .thread("INBOX", ThreadAlgorithm::References, "", false)
            .unwrap();
        assert_eq!(
            h.sent_lines().last().map(String::as_str),
            Some("UID THREAD REFERENCES utf-8 ALL")
        );
        h.server(&format!(
            "* THREAD (2)(3 6 (4))\r\n{} OK threaded\r\n",
            h.tag_of("UID THREAD")
        ));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let threads = m
            .events()
            .try_iter()
            .find_map(|e| match e {
                Event::ThreadResult { threads, .. } => Some(threads),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            threads,
            vec![
                leaf(2),
                ThreadNode {
                    id: 3,
                    children: vec![ThreadNode {
                        id: 6,
                        children: vec![leaf(4)],
                    }],
                },
            ]
        );
    }

    #[test]
    fn unsupported_algorithm_fails_locally() {
        let (connector, mut m) = opened(" THREAD=ORDEREDSUBJECT");
        let h = connector.connection(0);
        let task = m.thread("INBOX", ThreadAlgorithm::Refs, "", false).unwrap();
        assert_eq!(
            m.task_failure(task),
            Some("The IMAP server doesn't support THREAD=REFS")
        );
        assert!(h.sent_lines().iter().all(|l| !l.starts_with("UID THREAD")));
    }

    #[test]
    fn incremental_threading_through_esearch() {
        let (connector, mut m) = opened(" THREAD=REFS ETHREAD");
        let h = connector.connection(0);
        let task = m.thread("INBOX", ThreadAlgorithm::Refs, "UID 5:*", true).unwrap();
        assert_eq!(
            h.sent_lines().last().map(String::as_str),
            Some("UID THREAD RETURN (INCTHREAD) REFS utf-8 UID 5:*")
        );
        let tag = h.tag_of("UID THREAD");
        h.server(&format!(
            "* ESEARCH (TAG \"{}\") UID INCTHREAD 3 (3 6)\r\n{} OK threaded\r\n",
            tag, tag
        ));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let updates = m
            .events()
            .try_iter()
            .find_map(|e| match e {
                Event::ThreadUpdate { updates, .. } => Some(updates),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            updates,
            vec![(
                3,
                vec![ThreadNode {
                    id: 3,
                    children: vec![leaf(6)],
                }]
            )]
        );
    }

    #[test]
    fn refused_thread_is_a_failure() {
        let (connector, mut m) = opened(" THREAD=REFERENCES");
        let h = connector.connection(0);
        let task = m
            .thread("INBOX", ThreadAlgorithm::References, "", false)
            .unwrap();
        h.server(&format!("{} NO nope\r\n", h.tag_of("UID THREAD")));
        m.poll();
        assert_eq!(m.task_failure(task), Some("Threading failed"));
    }
}
