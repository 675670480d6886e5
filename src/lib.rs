//! An IMAP client engine which runs many dependency-ordered operations over a few long-lived
//! connections and keeps a cached picture of the server in sync with what the server reports.
//!
//! The [`Model`] is the whole engine. Consumers ask it for work (open a mailbox, download an
//! envelope, move some messages, sort a mailbox, ...) and get a [`TaskId`] back; the model turns
//! every request into a small tree of tasks which wait for each other, share connections and
//! take turns owning the selected mailbox of a connection. Everything the engine learns lands in
//! the [`MailboxTree`] and in the [`Cache`], and every change is announced as an [`Event`].
//!
//! The engine never blocks and never spawns threads. It is driven by calling [`Model::poll`]
//! (or [`Model::tick`] with an explicit clock) from the consumer's own loop.
//!
//! # Usage
//!
//! ```no_run
//! use imap_engine::{ConnectionBuilder, EngineConfig, Event, MemoryCache, Model};
//!
//! fn main() -> imap_engine::Result<()> {
//!     let connector = ConnectionBuilder::new("imap.example.com", 993);
//!     let config = EngineConfig::default().with_credentials("user", "secret");
//!     let mut model = Model::new(config, MemoryCache::new(), connector);
//!
//!     let open = model.open_mailbox("INBOX")?;
//!     loop {
//!         model.poll();
//!         for event in model.events().try_iter() {
//!             if let Event::TaskFailed { task, reason } = event {
//!                 if task == open {
//!                     eprintln!("cannot open INBOX: {}", reason);
//!                     return Ok(());
//!                 }
//!             }
//!         }
//!         if let Some(inbox) = model.tree().find("INBOX") {
//!             if model.maintaining_task("INBOX").is_some() {
//!                 println!("INBOX has {} messages", model.tree().messages(inbox).len());
//!                 return Ok(());
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! # Testing
//!
//! With the `test_helpers` feature the [`testing`] module provides a scripted server: a
//! [`Connector`] whose connections record the commands the engine sends and replay canned
//! responses, so that whole conversations can be exercised without a network.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod cache;
mod config;
mod conn;
mod connection;
mod connection_builder;
mod events;
mod model;
mod parse;
mod parser;
mod tasks;
mod tree;
mod utils;

pub mod error;
pub mod extensions;
pub mod types;

pub use crate::cache::{Cache, MailboxMetadata, MemoryCache, MessageMetadata};
pub use crate::config::EngineConfig;
pub use crate::conn::{Socket, StartTls, TlsBackend};
pub use crate::connection::Connection;
pub use crate::connection_builder::ConnectionBuilder;
pub use crate::error::{Error, Result};
pub use crate::extensions::sort::{SortCriterion, ThreadAlgorithm};
pub use crate::model::Model;
pub use crate::parser::{Command, Connector, Parser, StoreMode, StreamParser};
pub use crate::tasks::{CopyMoveOperation, MailboxOperation, TaskKind};
pub use crate::tree::{FetchState, MailboxNode, MailboxTree, MessageNode};
pub use crate::types::*;

#[cfg(test)]
mod mock_stream;

#[cfg(any(feature = "test_helpers", test))]
pub mod testing;
