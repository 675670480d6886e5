use super::{check_abort_die, completes, ImapTask, TaskKind};
use crate::cache::MailboxMetadata;
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{ListKind, ListResponse, MailboxId, StateKind, StateResponse, Tag, TaskId};

/// A change to the set of mailboxes on the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxOperation {
    /// `CREATE`
    Create,
    /// `DELETE`
    Delete,
    /// `SUBSCRIBE`
    Subscribe,
    /// `UNSUBSCRIBE`
    Unsubscribe,
}

impl MailboxOperation {
    pub(crate) fn kind(self) -> TaskKind {
        match self {
            MailboxOperation::Create => TaskKind::CreateMailbox,
            MailboxOperation::Delete => TaskKind::DeleteMailbox,
            MailboxOperation::Subscribe | MailboxOperation::Unsubscribe => {
                TaskKind::SubscribeUnsubscribe
            }
        }
    }
}

const SUBSCRIBED: &str = "\\Subscribed";

/// Creates, deletes, subscribes or unsubscribes a mailbox by name, and tells the tree.
///
/// A created mailbox is looked up with `LIST` right away so that it enters the tree with its
/// real separator and attributes.
#[derive(Debug)]
pub(crate) struct MailboxAdminTask {
    op: MailboxOperation,
    name: String,
    tag: Option<Tag>,
    list_tag: Option<Tag>,
    listed: Option<ListResponse>,
}

impl MailboxAdminTask {
    pub(crate) fn new(op: MailboxOperation, name: String) -> Self {
        MailboxAdminTask {
            op,
            name,
            tag: None,
            list_tag: None,
            listed: None,
        }
    }

    /// The mailbox which should hold `name`, by the separator the server reported.
    fn parent_of(model: &Model, name: &str, separator: Option<&str>) -> MailboxId {
        separator
            .and_then(|sep| name.rsplit_once(sep))
            .and_then(|(parent, _)| model.tree.find(parent))
            .unwrap_or_else(|| model.tree.root())
    }

    fn refresh_cached_children(model: &mut Model, parent: MailboxId) {
        if let Some(parent_name) = model.tree.name(parent) {
            let children = model.tree.children_metadata(parent);
            model.cache.set_child_mailboxes(&parent_name, &children);
        }
    }

    fn created(&mut self, model: &mut Model) {
        let listed = match self.listed.take() {
            Some(listed) => listed,
            None => {
                log::warn!("LIST after CREATE did not return {:?}", self.name);
                return;
            }
        };
        let parent = Self::parent_of(model, &listed.name, listed.separator.as_deref());
        model.tree.add_child(
            parent,
            MailboxMetadata {
                name: listed.name,
                separator: listed.separator,
                attributes: listed.attributes,
            },
        );
        Self::refresh_cached_children(model, parent);
    }

    fn deleted(&mut self, model: &mut Model, message: &str) {
        model.cache.forget_child_mailboxes(&self.name);
        model.cache.clear_all_messages(&self.name);
        let id = match model.tree.find(&self.name) {
            Some(id) => id,
            None => {
                log::info!(
                    "The IMAP server just told us that it succeeded to delete mailbox named {:?}, \
                     yet we don't know of any such mailbox. Message from the server: {}",
                    self.name,
                    message
                );
                return;
            }
        };
        let parent = model
            .tree
            .mailbox(id)
            .and_then(|m| m.parent())
            .unwrap_or_else(|| model.tree.root());
        model.tree.remove_mailbox(id);
        Self::refresh_cached_children(model, parent);
    }
}

impl ImapTask for MailboxAdminTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        let name = self.name.clone();
        let command = match self.op {
            MailboxOperation::Create => Command::Create(name),
            MailboxOperation::Delete => Command::Delete(name),
            MailboxOperation::Subscribe => Command::Subscribe(name),
            MailboxOperation::Unsubscribe => Command::Unsubscribe(name),
        };
        self.tag = Some(model.send(conn, command)?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if completes(resp, &self.list_tag) {
            if resp.kind == StateKind::Ok {
                self.created(model);
                model.task_completed(me);
            } else {
                model.task_failed(me, "Error with the LIST command after the CREATE");
            }
            return Ok(true);
        }
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind != StateKind::Ok {
            let reason = match self.op {
                MailboxOperation::Create => format!("Cannot create mailbox: {}", resp.message),
                MailboxOperation::Delete => format!("Couldn't delete mailbox: {}", resp.message),
                MailboxOperation::Subscribe | MailboxOperation::Unsubscribe => {
                    "SUBSCRIBE/UNSUBSCRIBE has failed".to_string()
                }
            };
            model.task_failed(me, &reason);
            return Ok(true);
        }
        match self.op {
            MailboxOperation::Create => {
                if model.core(me).dead {
                    model.task_failed(me, "Asked to die");
                    return Ok(true);
                }
                let conn = model.conn_of(me)?;
                self.list_tag = Some(model.send(
                    conn,
                    Command::List {
                        reference: String::new(),
                        pattern: self.name.clone(),
                        return_options: Vec::new(),
                    },
                )?);
            }
            MailboxOperation::Delete => {
                self.deleted(model, &resp.message);
                model.task_completed(me);
            }
            MailboxOperation::Subscribe | MailboxOperation::Unsubscribe => {
                if let Some(id) = model.tree.find(&self.name) {
                    let subscribed = self.op == MailboxOperation::Subscribe;
                    model.tree.set_attribute(id, SUBSCRIBED, subscribed);
                }
                model.task_completed(me);
            }
        }
        Ok(true)
    }

    fn handle_list(&mut self, _model: &mut Model, _me: TaskId, resp: &ListResponse) -> Result<bool> {
        if self.list_tag.is_none() || resp.kind != ListKind::List || resp.name != self.name {
            return Ok(false);
        }
        self.listed = Some(resp.clone());
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

    fn listed() -> (ScriptedConnector, Model) {
        let connector =
            ScriptedConnector::new().with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n");
        let mut m = Model::new(EngineConfig::default(), MemoryCache::new(), connector.clone());
        m.list_child_mailboxes("").unwrap();
        m.poll();
        let h = connector.connection(0);
        h.server(&format!(
            "* LIST () \"/\" INBOX\r\n* LIST () \"/\" Work\r\n{} OK listed\r\n",
            h.tag_of("LIST")
        ));
        m.poll();
        (connector, m)
    }

    #[test]
    fn created_mailbox_joins_its_parent() {
        let (connector, mut m) = listed();
        let h = connector.connection(0);
        let task = m.create_mailbox("Work/Drafts").unwrap();
        assert_eq!(h.sent_lines().last().map(String::as_str), Some("CREATE \"Work/Drafts\""));
        h.server(&format!("{} OK created\r\n", h.tag_of("CREATE")));
        m.poll();
        assert_eq!(
            h.sent_lines().last().map(String::as_str),
            Some("LIST \"\" \"Work/Drafts\"")
        );
        h.server(&format!(
            "* LIST (\\HasNoChildren) \"/\" Work/Drafts\r\n{} OK listed\r\n",
            h.tag_of("LIST \"\" \"Work/Drafts\"")
        ));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let work = m.tree().find("Work").unwrap();
        let drafts = m.tree().find("Work/Drafts").unwrap();
        assert_eq!(m.tree().mailbox(drafts).unwrap().parent(), Some(work));
        let cached = m.cached_child_mailboxes("Work").unwrap();
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn failed_create_reports_server_text() {
        let (connector, mut m) = listed();
        let h = connector.connection(0);
        let task = m.create_mailbox("Work").unwrap();
        h.server(&format!("{} NO [ALREADYEXISTS] exists\r\n", h.tag_of("CREATE")));
        m.poll();
        assert_eq!(m.task_failure(task), Some("Cannot create mailbox: exists"));
    }

    #[test]
    fn deleted_mailbox_leaves_tree_and_cache() {
        let (connector, mut m) = listed();
        let h = connector.connection(0);
        let task = m.delete_mailbox("Work").unwrap();
        h.server(&format!("{} OK deleted\r\n", h.tag_of("DELETE")));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        assert_eq!(m.tree().find("Work"), None);
        let cached = m.cached_child_mailboxes("").unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "INBOX");
    }

    #[test]
    fn subscription_is_an_attribute() {
        let (connector, mut m) = listed();
        let h = connector.connection(0);
        let task = m.subscribe_mailbox("Work").unwrap();
        h.server(&format!("{} OK subscribed\r\n", h.tag_of("SUBSCRIBE")));
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        let work = m.tree().find("Work").unwrap();
        assert!(m
            .tree()
            .mailbox(work)
            .unwrap()
            .attributes()
            .iter()
            .any(|a| a == "\\Subscribed"));

        let task = m.unsubscribe_mailbox("Work").unwrap();
        h.server(&format!("{} NO not today\r\n", h.tag_of("UNSUBSCRIBE")));
        m.poll();
        assert_eq!(m.task_failure(task), Some("SUBSCRIBE/UNSUBSCRIBE has failed"));
    }
}
