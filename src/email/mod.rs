//! Mailbox accounts and the IMAP poller that turns their mail into tickets.
//!
//! Each account owns one `imap_poll` scheduled task. A poll walks the UIDs the
//! server reports, skips those already `imported`, and records every outcome
//! per `(account, uid)` so a failed message is retried on the next poll.

pub mod accounts;
pub mod client;
pub mod match_context;
pub mod mime;
pub mod poller;
pub mod records;
pub mod service;

pub use accounts::{
    MailboxAccount, MailboxInput, MailboxRecord, MailboxStore, MemoryMailboxStore, PgMailboxStore,
};
#[cfg(feature = "mail")]
pub use client::ImapConnector;
pub use client::{ConnectParams, FetchedMessage, MailboxConnector, MailboxSession, MemoryMailboxConnector};
pub use match_context::match_context;
pub use mime::{parse_message, AddressList, ParsedEmail};
pub use poller::{ImapPoller, PollReport, PollStatus, PENDING_RESTART};
pub use records::{MemoryMessageLog, MessageLog, MessageRecord, MessageStatus, PgMessageLog};
pub use service::MailboxService;
