use std::sync::mpsc;

use super::types::Event;

/// The sending half of the event channel, shared by the model and the mailbox tree.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub(crate) fn new(sender: mpsc::Sender<Event>) -> EventSender {
        EventSender { sender }
    }

    // A consumer which dropped its receiver simply stops hearing about things.
    pub(crate) fn send(&self, e: Event) {
        log::trace!("event: {:?}", e);
        let _ = self.sender.send(e);
    }
}
