use serde_json::{json, Map, Value};

use super::accounts::MailboxAccount;
use super::mime::{AddressList, ParsedEmail};

pub const SEEN_FLAG: &str = "\\Seen";

fn address_value(list: &AddressList) -> Value {
    let domains = list.domains();
    json!({
        "raw": list.raw,
        "addresses": list.addresses,
        "domains": domains,
        "address": list.address(),
        "domain": domains.first(),
    })
}

/// The document a mailbox filter rule is evaluated against.
pub fn match_context(account: &MailboxAccount, email: &ParsedEmail, flags: &[String]) -> Value {
    let is_read = flags.iter().any(|f| f.eq_ignore_ascii_case(SEEN_FLAG));
    let headers: Map<String, Value> = email
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let body = if email.body_text.trim().is_empty() {
        email.body_html.as_str()
    } else {
        email.body_text.as_str()
    };

    json!({
        "account": {
            "id": account.id,
            "name": account.name,
            "username": account.username,
            "host": account.host,
            "priority": account.priority,
            "module_slug": account.module_slug,
        },
        "mailbox": { "folder": account.folder },
        "subject": email.subject,
        "body": body,
        "message_id": email.message_id,
        "from": address_value(&email.from),
        "to": address_value(&email.to),
        "cc": address_value(&email.cc),
        "bcc": address_value(&email.bcc),
        "reply_to": address_value(&email.reply_to),
        "sender": address_value(&email.sender),
        "flags": flags,
        "is_unread": !is_read,
        "is_read": is_read,
        "headers": headers,
    })
}
