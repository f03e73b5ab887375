pub mod automation;
pub mod core;
pub mod email;
pub mod filter;
pub mod tasks;
pub mod template;
pub mod tickets;
pub mod webhooks;
