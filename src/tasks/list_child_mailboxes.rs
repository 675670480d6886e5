use super::{check_abort_die, completes, ImapTask};
use crate::cache::MailboxMetadata;
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::tree::FetchState;
use crate::types::{
    ListKind, ListResponse, MailboxId, StateKind, StateResponse, StatusResponse, Tag, TaskId,
};

/// Items asked for through `LIST-STATUS`.
const STATUS_ITEMS: &str = "MESSAGES UNSEEN RECENT";

/// Separator assumed for a mailbox the server never described.
const DEFAULT_SEPARATOR: &str = ".";

/// `LIST` of the direct children of a mailbox, replacing what the tree knew about them.
///
/// `STATUS` data arriving with the listing is held back until the new children are in the tree,
/// so that it has somewhere to go.
#[derive(Debug)]
pub(crate) struct ListChildMailboxesTask {
    mailbox: MailboxId,
    prefix: String,
    tag: Option<Tag>,
    listed: Vec<MailboxMetadata>,
    pending_status: Vec<StatusResponse>,
}

impl ListChildMailboxesTask {
    pub(crate) fn new(mailbox: MailboxId) -> Self {
        ListChildMailboxesTask {
            mailbox,
            prefix: String::new(),
            tag: None,
            listed: Vec::new(),
            pending_status: Vec::new(),
        }
    }

    fn separator(&self, model: &Model) -> String {
        let tree = &model.tree;
        tree.mailbox(self.mailbox)
            .and_then(|m| m.separator())
            .or_else(|| {
                let root = tree.mailbox(tree.root())?;
                root.children()
                    .iter()
                    .find_map(|&c| tree.mailbox(c).and_then(|m| m.separator()))
            })
            .unwrap_or(DEFAULT_SEPARATOR)
            .to_owned()
    }

    fn apply_cached_status(&mut self, model: &mut Model) {
        for status in self.pending_status.drain(..) {
            if let Some(id) = model.tree.find(&status.mailbox) {
                model.tree.set_status(id, status);
            }
        }
    }

    fn finalize(&mut self, model: &mut Model) {
        let parent_name = model.tree.name(self.mailbox).unwrap_or_default();
        let children: Vec<MailboxMetadata> = std::mem::take(&mut self.listed)
            .into_iter()
            .filter(|m| m.name != parent_name)
            .collect();
        log::debug!("{} children of {:?}", children.len(), parent_name);
        model.cache.set_child_mailboxes(&parent_name, &children);
        model.tree.set_children(self.mailbox, children);
        model.tree.set_children_state(self.mailbox, FetchState::Done);
    }
}

impl ImapTask for ListChildMailboxesTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox vanished before we could ask for its children");
            return Ok(());
        }
        let pattern = if self.mailbox == model.tree.root() {
            "%".to_string()
        } else {
            let name = model.tree.name(self.mailbox).unwrap_or_default();
            self.prefix = format!("{}{}", name, self.separator(model));
            format!("{}%", self.prefix)
        };

        let conn = model.conn_of(me)?;
        let mut return_options = Vec::new();
        if model.conn(conn).map(|c| c.capabilities_fresh).unwrap_or(false) {
            if model.has_capability(conn, "LIST-EXTENDED") {
                return_options.push("SUBSCRIBED".to_string());
                return_options.push("CHILDREN".to_string());
            }
            if model.has_capability(conn, "LIST-STATUS") {
                return_options.push(format!("STATUS ({})", STATUS_ITEMS));
            }
        }
        self.tag = Some(model.send(
            conn,
            Command::List {
                reference: String::new(),
                pattern,
                return_options,
            },
        )?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if !model.tree.is_valid(self.mailbox) {
            self.apply_cached_status(model);
            model.task_failed(me, "Mailbox no longer available -- weird timing?");
        } else if resp.kind == StateKind::Ok {
            self.finalize(model);
            self.apply_cached_status(model);
            model.task_completed(me);
        } else {
            model.tree.set_children_state(self.mailbox, FetchState::Unavailable);
            self.apply_cached_status(model);
            model.task_failed(me, "LIST failed");
        }
        Ok(true)
    }

    fn handle_list(&mut self, _model: &mut Model, _me: TaskId, resp: &ListResponse) -> Result<bool> {
        if self.tag.is_none() || resp.kind != ListKind::List || !resp.name.starts_with(&self.prefix) {
            return Ok(false);
        }
        self.listed.push(MailboxMetadata {
            name: resp.name.clone(),
            separator: resp.separator.clone(),
            attributes: resp.attributes.clone(),
        });
        Ok(true)
    }

    fn handle_status(&mut self, model: &mut Model, _me: TaskId, resp: &StatusResponse) -> Result<bool> {
        if self.tag.is_none() || !model.tree.is_valid(self.mailbox) || !resp.mailbox.starts_with(&self.prefix) {
            return Ok(false);
        }
        self.pending_status.push(resp.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::model::Model;
    use crate::testing::ScriptedConnector;
    use crate::tree::FetchState;
    use crate::types::TaskState;

    fn authenticated(caps: &str) -> (ScriptedConnector, Model) {
        let connector = ScriptedConnector::new()
            .with_greeting(&format!("* PREAUTH [CAPABILITY IMAP4rev1{}] hi\r\n", caps));
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.get_any_connection().unwrap();
        m.poll();
        (connector, m)
    }

    fn names(m: &Model, parent: crate::types::MailboxId) -> Vec<String> {
        m.tree()
            .mailbox(parent)
            .unwrap()
            .children()
            .iter()
            .map(|&c| m.tree().mailbox(c).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn top_level_listing_fills_tree_and_cache() {
        let (connector, mut m) = authenticated("");
        let h = connector.connection(0);
        let task = m.list_child_mailboxes("").unwrap();
        assert_eq!(h.sent_lines().last().map(String::as_str), Some("LIST \"\" \"%\""));
        h.server(&format!(
            "* LIST (\\HasNoChildren) \".\" INBOX\r\n\
             * LIST (\\HasChildren) \".\" Archive\r\n\
             {} OK listed\r\n",
            h.tag_of("LIST")
        ));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let root = m.tree().root();
        assert_eq!(names(&m, root), vec!["INBOX", "Archive"]);
        assert_eq!(m.tree().mailbox(root).unwrap().children_state(), FetchState::Done);
        let cached = m.cached_child_mailboxes("").unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[1].separator.as_deref(), Some("."));
    }

    #[test]
    fn status_waits_for_the_listing() {
        let (connector, mut m) = authenticated(" LIST-EXTENDED LIST-STATUS");
        let h = connector.connection(0);
        m.list_child_mailboxes("").unwrap();
        h.server(&format!(
            "* LIST (\\HasChildren) \".\" Archive\r\n{} OK listed\r\n",
            h.tag_of("LIST")
        ));
        m.poll();
        let task = m.list_child_mailboxes("Archive").unwrap();
        assert_eq!(
            h.sent_lines().last().map(String::as_str),
            Some("LIST \"\" \"Archive.%\" RETURN (SUBSCRIBED CHILDREN STATUS (MESSAGES UNSEEN RECENT))")
        );
        h.server(&format!(
            "* STATUS Archive.2020 (MESSAGES 12 UNSEEN 1 RECENT 0)\r\n\
             * LIST (\\HasNoChildren) \".\" Archive.2020\r\n\
             {} OK listed\r\n",
            h.tag_of("LIST \"\" \"Archive")
        ));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let child = m.tree().find("Archive.2020").unwrap();
        assert_eq!(
            m.tree().mailbox(child).unwrap().status().and_then(|s| s.messages),
            Some(12)
        );
    }

    #[test]
    fn failed_listing_is_reported() {
        let (connector, mut m) = authenticated("");
        let h = connector.connection(0);
        let task = m.list_child_mailboxes("").unwrap();
        h.server(&format!("{} NO no way\r\n", h.tag_of("LIST")));
        m.poll();
        assert_eq!(m.task_failure(task), Some("LIST failed"));
        let root = m.tree().root();
        assert_eq!(m.tree().mailbox(root).unwrap().children_state(), FetchState::Unavailable);
    }
}
