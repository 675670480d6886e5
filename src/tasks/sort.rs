use super::keep_mailbox_open::break_possible_idle;
use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::extensions::sort::SortCriterion;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{
    ESearchResponse, Event, MailboxId, RespCode, StateKind, StateResponse, Tag, TaskId, Uid,
};

const CHARSET: &str = "utf-8";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Init,
    /// Waiting for the initial result.
    Running,
    /// The initial result is out, the server keeps pushing changes.
    Updating,
    /// `CANCELUPDATE` was sent.
    Cancelling,
}

/// `UID SORT`, or a plain `UID SEARCH` when no sort criteria are given.
///
/// A persistent request uses `CONTEXT=SORT` (or `CONTEXT=SEARCH`) when the server has it, and
/// then stays active after the initial result, reporting `ADDTO`/`REMOVEFROM` changes until
/// either side stops them.
#[derive(Debug)]
pub(crate) struct SortTask {
    mailbox: MailboxId,
    criteria: Vec<SortCriterion>,
    search: String,
    persistent: bool,
    phase: Phase,
    tag: Option<Tag>,
    cancel_tag: Option<Tag>,
    cancel_requested: bool,
    result: Vec<Uid>,
}

impl SortTask {
    pub(crate) fn new(
        mailbox: MailboxId,
        criteria: Vec<SortCriterion>,
        search: String,
        persistent: bool,
    ) -> Self {
        SortTask {
            mailbox,
            criteria,
            search: if search.is_empty() { "ALL".to_string() } else { search },
            persistent,
            phase: Phase::Init,
            tag: None,
            cancel_tag: None,
            cancel_requested: false,
            result: Vec::new(),
        }
    }

    fn sorting(&self) -> bool {
        !self.criteria.is_empty()
    }

    fn command(&mut self, model: &Model, conn: crate::types::ConnId) -> Option<Command> {
        let cap = |c: &str| model.has_capability(conn, c);
        let search = self.search.clone();
        if self.sorting() {
            if !cap("SORT") {
                return None;
            }
            let criteria = self.criteria.clone();
            let charset = CHARSET.to_string();
            if self.persistent && cap("ESORT") && cap("CONTEXT=SORT") {
                Some(Command::UidESort {
                    criteria,
                    charset,
                    search,
                    return_options: vec!["ALL".to_string(), "UPDATE".to_string()],
                })
            } else {
                self.persistent = false;
                if cap("ESORT") {
                    Some(Command::UidESort {
                        criteria,
                        charset,
                        search,
                        return_options: vec!["ALL".to_string()],
                    })
                } else {
                    Some(Command::UidSort {
                        criteria,
                        charset,
                        search,
                    })
                }
            }
        } else if self.persistent && cap("ESEARCH") && cap("CONTEXT=SEARCH") {
            Some(Command::UidESearch {
                criteria: search,
                return_options: vec!["ALL".to_string(), "UPDATE".to_string()],
            })
        } else {
            self.persistent = false;
            if cap("ESEARCH") {
                Some(Command::UidESearch {
                    criteria: search,
                    return_options: vec!["ALL".to_string()],
                })
            } else {
                Some(Command::UidSearch(search))
            }
        }
    }

    fn send_cancel(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let tag = match self.tag {
            Some(ref tag) => tag.clone(),
            None => return Ok(()),
        };
        let conn = model.conn_of(me)?;
        break_possible_idle(model, conn);
        self.cancel_tag = Some(model.send(conn, Command::CancelUpdate(vec![tag]))?);
        self.phase = Phase::Cancelling;
        model.core_mut(me).idle_compatible = false;
        model.emit(Event::SortUpdatesStopped(me));
        Ok(())
    }

    fn initial_result_arrived(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        model.emit(Event::SortResult {
            task: me,
            uids: std::mem::take(&mut self.result),
        });
        if !self.persistent {
            model.task_completed(me);
            return Ok(());
        }
        self.phase = Phase::Updating;
        if self.cancel_requested {
            return self.send_cancel(model, me);
        }
        model.core_mut(me).idle_compatible = true;
        if let Some(owner) = model.core(me).owner {
            model.wake(owner);
        }
        Ok(())
    }

    fn collecting(&self) -> bool {
        self.phase == Phase::Running
    }
}

impl ImapTask for SortTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox disappeared");
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        let command = match self.command(model, conn) {
            Some(command) => command,
            None => {
                model.task_failed(me, "The IMAP server doesn't support SORT");
                return Ok(());
            }
        };
        self.tag = Some(model.send(conn, command)?);
        self.phase = Phase::Running;
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if let Some(RespCode::NoUpdate(ref tag)) = resp.code {
            if resp.tag.is_none() && self.tag.as_ref() == Some(tag) {
                log::debug!("{}: the server stopped updating the sort: {}", me, resp.message);
                if self.phase == Phase::Updating {
                    model.emit(Event::SortUpdatesStopped(me));
                    model.task_completed(me);
                } else {
                    self.persistent = false;
                }
                return Ok(true);
            }
            return Ok(false);
        }
        if completes(resp, &self.cancel_tag) {
            if resp.kind != StateKind::Ok {
                log::warn!("{}: CANCELUPDATE failed: {}", me, resp.message);
            }
            model.task_completed(me);
            return Ok(true);
        }
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind == StateKind::Ok {
            self.initial_result_arrived(model, me)?;
        } else if self.sorting() {
            model.task_failed(me, "Sorting failed");
        } else {
            model.task_failed(me, "Searching failed");
        }
        Ok(true)
    }

    fn handle_search(&mut self, _model: &mut Model, _me: TaskId, items: &[u32]) -> Result<bool> {
        if self.sorting() || !self.collecting() {
            return Ok(false);
        }
        self.result.extend_from_slice(items);
        Ok(true)
    }

    fn handle_sort(&mut self, _model: &mut Model, _me: TaskId, items: &[u32]) -> Result<bool> {
        if !self.sorting() || !self.collecting() {
            return Ok(false);
        }
        self.result.extend_from_slice(items);
        Ok(true)
    }

    fn handle_esearch(&mut self, model: &mut Model, me: TaskId, resp: &ESearchResponse) -> Result<bool> {
        if self.tag.is_none() || resp.tag != self.tag {
            return Ok(false);
        }
        if let Some(ref all) = resp.all {
            self.result = all.clone();
        }
        for update in &resp.incremental {
            if self.collecting() {
                // the initial result is not out yet, fold the change into it
                apply_update(&mut self.result, update.add, update.offset, &update.uids);
            } else if self.phase == Phase::Updating {
                model.emit(Event::SortUpdate {
                    task: me,
                    update: update.clone(),
                });
            }
        }
        Ok(true)
    }

    fn cancel_updates(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        match self.phase {
            Phase::Updating => self.send_cancel(model, me),
            Phase::Init | Phase::Running if self.persistent => {
                self.cancel_requested = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn abort(&mut self, model: &mut Model, me: TaskId) {
        if self.phase == Phase::Updating {
            if let Err(e) = self.send_cancel(model, me) {
                model.task_error(me, e);
            }
        } else {
            self.cancel_requested = true;
            model.core_mut(me).aborted = true;
        }
    }

    fn die(&mut self, model: &mut Model, me: TaskId, reason: &str) {
        if self.phase == Phase::Updating {
            model.emit(Event::SortUpdatesStopped(me));
        }
        model.task_failed(me, reason);
    }
}

/// Fold an `ADDTO`/`REMOVEFROM` change into a result list; offset `0` means "position unknown".
fn apply_update(result: &mut Vec<Uid>, add: bool, offset: u32, uids: &[Uid]) {
    if add {
        let at = if offset == 0 {
            result.len()
        } else {
            (offset as usize - 1).min(result.len())
        };
        result.splice(at..at, uids.iter().copied());
    } else {
        result.retain(|uid| !uids.contains(uid));
    }
}

#[cfg(test)]
mod tests {
    use super::apply_update;
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::extensions::sort::SortCriterion;
    use crate::model::Model;
    use crate::testing::{synchronize, ScriptedConnector};
    use crate::types::{Event, TaskState};

    fn opened(caps: &str) -> (ScriptedConnector, Model) {
        let connector = ScriptedConnector::new()
            .with_greeting(&format!("* PREAUTH [CAPABILITY IMAP4rev1{}] hi\r\n", caps));
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.open_mailbox("INBOX").unwrap();
        m.poll();
        synchronize(&mut m, &connector.connection(0), &[1, 2, 3]);
        (connector, m)
    }

    fn sort_events(m: &Model) -> Vec<Event> {
        m.events()
            .try_iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::SortResult { .. } | Event::SortUpdate { .. } | Event::SortUpdatesStopped(_)
                )
            })
            .collect()
    }

    #[test]
    fn plain_sort_reports_the_order() {
        let (connector, mut m) = opened(" SORT");
        let h = connector.connection(0);
        let task = m
            .sort("INBOX", vec![SortCriterion::Arrival.reversed()], "", false)
            .unwrap();
        assert_eq!(
            h.sent_lines().last().map(String::as_str),
            Some("UID SORT (REVERSE ARRIVAL) utf-8 ALL")
        );
        h.server(&format!("* SORT 3 2 1\r\n{} OK sorted\r\n", h.tag_of("UID SORT")));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        match &sort_events(&m)[..] {
            [Event::SortResult { task: t, uids }] => {
                assert_eq!(*t, task);
                assert_eq!(uids, &vec![3, 2, 1]);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn empty_criteria_only_search() {
        let (connector, mut m) = opened("");
        let h = connector.connection(0);
        let task = m.sort("INBOX", vec![], "UNSEEN", false).unwrap();
        assert_eq!(h.sent_lines().last().map(String::as_str), Some("UID SEARCH UNSEEN"));
        h.server(&format!("* SEARCH 2 3\r\n{} OK done\r\n", h.tag_of("UID SEARCH UNSEEN")));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        assert!(matches!(
            &sort_events(&m)[..],
            [Event::SortResult { uids, .. }] if uids == &vec![2, 3]
        ));
    }

    #[test]
    fn sort_needs_the_extension() {
        let (_connector, mut m) = opened("");
        let task = m.sort("INBOX", vec![SortCriterion::Size], "", false).unwrap();
        assert_eq!(m.task_failure(task), Some("The IMAP server doesn't support SORT"));
    }

    #[test]
    fn persistent_sort_until_the_server_stops() {
        let (connector, mut m) = opened(" SORT ESORT CONTEXT=SORT");
        let h = connector.connection(0);
        let task = m.sort("INBOX", vec![SortCriterion::Subject], "ALL", true).unwrap();
        assert_eq!(
            h.sent_lines().last().map(String::as_str),
            Some("UID SORT RETURN (ALL UPDATE) (SUBJECT) utf-8 ALL")
        );
        let tag = h.tag_of("UID SORT");
        h.server(&format!(
            "* ESEARCH (TAG \"{}\") UID ALL 2,1,3\r\n{} OK sorted\r\n",
            tag, tag
        ));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Active));

        h.server(&format!("* ESEARCH (TAG \"{}\") UID ADDTO (2 7)\r\n", tag));
        m.poll();
        h.server(&format!("* NO [NOUPDATE \"{}\"] too much work\r\n", tag));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));

        let events = sort_events(&m);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Event::SortResult { uids, .. } if uids == &vec![2, 1, 3]));
        match &events[1] {
            Event::SortUpdate { update, .. } => {
                assert!(update.add);
                assert_eq!(update.offset, 2);
                assert_eq!(update.uids, vec![7]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(events[2], Event::SortUpdatesStopped(t) if t == task));
    }

    #[test]
    fn cancelled_sort_sends_cancelupdate() {
        let (connector, mut m) = opened(" SORT ESORT CONTEXT=SORT");
        let h = connector.connection(0);
        let task = m.sort("INBOX", vec![SortCriterion::Date], "ALL", true).unwrap();
        let tag = h.tag_of("UID SORT");
        h.server(&format!("* ESEARCH (TAG \"{}\") UID ALL 1:3\r\n{} OK sorted\r\n", tag, tag));
        m.poll();

        m.cancel_sort_updates(task).unwrap();
        assert_eq!(
            h.sent_lines().last().map(|l| l.to_string()),
            Some(format!("CANCELUPDATE \"{}\"", tag))
        );
        h.server(&format!("{} OK cancelled\r\n", h.tag_of("CANCELUPDATE")));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let events = sort_events(&m);
        assert!(matches!(events.last(), Some(Event::SortUpdatesStopped(t)) if *t == task));
    }

    #[test]
    fn updates_fold_into_a_pending_result() {
        let mut result = vec![1, 2, 3];
        apply_update(&mut result, true, 2, &[9]);
        assert_eq!(result, vec![1, 9, 2, 3]);
        apply_update(&mut result, false, 0, &[2]);
        assert_eq!(result, vec![1, 9, 3]);
        apply_update(&mut result, true, 0, &[4]);
        assert_eq!(result, vec![1, 9, 3, 4]);
    }
}
