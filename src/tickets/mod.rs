//! Tickets, replies and the email ingestion path that feeds them.

pub mod attachments;
pub mod classifier;
pub mod context;
pub mod directory;
pub mod events;
pub mod ingestor;
pub mod merge;
pub mod models;
pub mod pg;
pub mod repository;
pub mod sanitizer;
pub mod service;
pub mod status;

pub use attachments::{AttachmentStore, InboundAttachment};
pub use classifier::{Classification, InboundMessage, MessageClassifier, Requester};
pub use context::ticket_context;
pub use directory::{ContactDirectory, MemoryContactDirectory};
pub use events::{DomainEvent, DomainEventSink, TICKET_CREATED, TICKET_UPDATED};
pub use ingestor::{IngestOutcome, MessageOrigin, TicketIngestor};
pub use merge::{resolve_merge_chain, MergeResolution};
pub use models::{Attachment, Reply, Ticket, Watcher, WatcherTarget};
pub use pg::{PgContactDirectory, PgTicketRepository};
pub use repository::{MemoryTicketRepository, SenderRef, TicketRepository};
pub use sanitizer::{AllowlistSanitizer, HtmlSanitizer, SanitizedHtml};
pub use service::{ReplyDraft, TicketService};
pub use status::{StatusDefinition, StatusSet};
