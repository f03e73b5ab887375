pub mod automation;
pub mod directory;
pub mod mail;
pub mod helpdesk;
pub mod webhooks;

pub use self::automation::*;
pub use self::directory::*;
pub use self::mail::*;
pub use self::helpdesk::*;
pub use self::webhooks::*;

diesel::allow_tables_to_appear_in_same_query!(
    tickets,
    ticket_replies,
    ticket_watchers,
    ticket_attachments,
    users,
    companies,
    company_staff,
    imap_accounts,
    imap_messages,
    scheduled_tasks,
    webhook_events,
    webhook_attempts,
    automations,
    integration_modules,
    message_templates,
    assets,
    issue_assignments,
);
