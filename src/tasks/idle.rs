//! Support for the IMAP IDLE command specificed in [RFC
//! 2177](https://tools.ietf.org/html/rfc2177), driven by the owner of an open mailbox.

use super::TimerKind;
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{ConnId, Tag, TaskId};

/// Enters and leaves `IDLE` on behalf of a [`KeepMailboxOpenTask`](super::KeepMailboxOpenTask).
///
/// `IDLE` is entered only after the mailbox was quiet for
/// [`EngineConfig::idle_delay`](crate::EngineConfig::idle_delay), and left with `DONE` as soon as
/// the owner has a command to send. `DONE` is pipelined: the next command goes out right after
/// it without waiting for the tagged completion of `IDLE`.
///
/// Note that the server MAY consider a client inactive if it has an IDLE command running, and if
/// such a server has an inactivity timeout it MAY log the client off implicitly at the end of its
/// timeout period.  Because of that, clients using IDLE are advised to terminate the IDLE and
/// re-issue it at least every 29 minutes to avoid being logged off. The renewal timer
/// ([`EngineConfig::idle_renewal`](crate::EngineConfig::idle_renewal)) does this.
#[derive(Debug, Default)]
pub(crate) struct IdleLauncher {
    /// `IDLE` was sent and `DONE` was not.
    idling: bool,
    /// The tag of the `IDLE` command until its tagged completion arrives.
    tag: Option<Tag>,
}

impl IdleLauncher {
    pub(crate) fn new() -> Self {
        IdleLauncher::default()
    }

    /// Enter `IDLE` once the mailbox was quiet for a while.
    pub(crate) fn enter_later(&mut self, model: &mut Model, owner: TaskId) {
        if self.idling || self.tag.is_some() {
            return;
        }
        let delay = model.config().idle_delay;
        model.start_timer(owner, TimerKind::IdleEnter, delay);
    }

    pub(crate) fn enter_now(&mut self, model: &mut Model, owner: TaskId, conn: ConnId) -> Result<()> {
        model.stop_timer(owner, TimerKind::IdleEnter);
        if self.idling || self.tag.is_some() {
            return Ok(());
        }
        self.tag = Some(model.send(conn, Command::Idle)?);
        self.idling = true;
        let renewal = model.config().idle_renewal;
        model.start_timer(owner, TimerKind::IdleRenewal, renewal);
        log::debug!("{}: entering IDLE", owner);
        Ok(())
    }

    /// Leave `IDLE` if it is running, and forget about entering it later.
    pub(crate) fn finish(&mut self, model: &mut Model, owner: TaskId, conn: ConnId) -> Result<()> {
        model.stop_timer(owner, TimerKind::IdleEnter);
        if !self.idling {
            return Ok(());
        }
        model.stop_timer(owner, TimerKind::IdleRenewal);
        self.idling = false;
        model.send(conn, Command::IdleDone)?;
        log::debug!("{}: leaving IDLE", owner);
        Ok(())
    }

    pub(crate) fn is_idle_tag(&self, tag: &Tag) -> bool {
        self.tag.as_ref() == Some(tag)
    }

    /// The tagged completion of `IDLE` arrived.
    pub(crate) fn completed(&mut self, model: &mut Model, owner: TaskId) {
        self.tag = None;
        self.idling = false;
        model.stop_timer(owner, TimerKind::IdleRenewal);
    }

    /// `IDLE` was sent and its tagged completion has not arrived yet.
    pub(crate) fn waiting_for_termination(&self) -> bool {
        self.tag.is_some()
    }

    pub(crate) fn die(&mut self, model: &mut Model, owner: TaskId) {
        model.stop_timer(owner, TimerKind::IdleEnter);
        model.stop_timer(owner, TimerKind::IdleRenewal);
        self.idling = false;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::testing::{synchronize, ScriptHandle, ScriptedConnector};

    fn selected() -> (ScriptHandle, Model, TaskId, ConnId) {
        let connector =
            ScriptedConnector::new().with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n");
        let config = EngineConfig::default().with_idle_delay(Duration::from_secs(3));
        let mut m = Model::new(config, MemoryCache::new(), connector.clone());
        let owner = m.open_mailbox("INBOX").unwrap();
        m.poll();
        let h = connector.connection(0);
        synchronize(&mut m, &h, &[1]);
        let conn = m.connections().next().unwrap().id();
        (h, m, owner, conn)
    }

    fn count(h: &ScriptHandle, line: &str) -> usize {
        h.sent_lines().iter().filter(|l| l.as_str() == line).count()
    }

    #[test]
    fn done_follows_idle() {
        let (h, mut m, owner, conn) = selected();
        let mut idle = IdleLauncher::new();

        idle.finish(&mut m, owner, conn).unwrap();
        assert_eq!(count(&h, "DONE"), 0);

        idle.enter_now(&mut m, owner, conn).unwrap();
        idle.enter_now(&mut m, owner, conn).unwrap();
        assert_eq!(count(&h, "IDLE"), 1);
        assert!(idle.is_idle_tag(&h.tag_of("IDLE")));
        assert!(m.timer_active(owner, TimerKind::IdleRenewal));

        idle.finish(&mut m, owner, conn).unwrap();
        assert_eq!(h.sent_lines().last().map(String::as_str), Some("DONE"));
        assert!(!m.timer_active(owner, TimerKind::IdleRenewal));
        assert!(idle.waiting_for_termination());

        idle.completed(&mut m, owner);
        assert!(!idle.waiting_for_termination());
    }

    #[test]
    fn entering_later_waits_for_quiet() {
        let (h, mut m, owner, conn) = selected();
        let mut idle = IdleLauncher::new();
        idle.enter_later(&mut m, owner);
        assert!(m.timer_active(owner, TimerKind::IdleEnter));
        assert_eq!(count(&h, "IDLE"), 0);

        idle.enter_now(&mut m, owner, conn).unwrap();
        assert!(!m.timer_active(owner, TimerKind::IdleEnter));
        idle.enter_later(&mut m, owner);
        assert!(!m.timer_active(owner, TimerKind::IdleEnter));

        idle.die(&mut m, owner);
        assert!(!m.timer_active(owner, TimerKind::IdleRenewal));
    }
}
