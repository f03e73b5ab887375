use serde_json::{json, Map, Value};

use super::directory::ContactDirectory;
use super::models::{Reply, Ticket};
use super::repository::TicketRepository;
use crate::core::error::CoreResult;
use crate::core::shared::utils::iso_utc;

/// Builds the `{ticket, actor}` context handed to automations.
///
/// `ticket.number` and `ticket.labels` are always present, as are the
/// `requester`, `company` and `latest_reply` keys (null when unknown).
pub async fn ticket_context(
    repo: &dyn TicketRepository,
    directory: &dyn ContactDirectory,
    ticket: &Ticket,
    actor_id: Option<i64>,
) -> CoreResult<Value> {
    let mut fields = ticket_fields(ticket)?;

    let requester = match ticket.requester_id {
        Some(id) => directory.user(id).await?.map(serde_json::to_value).transpose()?,
        None => None,
    };
    let company = match ticket.company_id {
        Some(id) => directory.company(id).await?.map(serde_json::to_value).transpose()?,
        None => None,
    };
    let latest_reply = match repo.replies(ticket.id).await?.pop() {
        Some(reply) => Some(reply_context(directory, &reply).await?),
        None => None,
    };

    fields.insert("requester".to_string(), requester.unwrap_or(Value::Null));
    fields.insert("company".to_string(), company.unwrap_or(Value::Null));
    fields.insert("latest_reply".to_string(), latest_reply.unwrap_or(Value::Null));

    Ok(json!({
        "ticket": Value::Object(fields),
        "actor": actor_id.map(|id| json!({ "id": id })),
    }))
}

fn ticket_fields(ticket: &Ticket) -> CoreResult<Map<String, Value>> {
    let mut fields = match serde_json::to_value(ticket)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    fields.insert("created_at".to_string(), json!(iso_utc(&ticket.created_at)));
    fields.insert("updated_at".to_string(), json!(iso_utc(&ticket.updated_at)));
    fields.insert(
        "closed_at".to_string(),
        json!(ticket.closed_at.as_ref().map(iso_utc)),
    );
    fields.insert("number".to_string(), json!(ticket.ticket_number));
    fields.insert("labels".to_string(), json!(ticket.ai_tags));
    Ok(fields)
}

async fn reply_context(directory: &dyn ContactDirectory, reply: &Reply) -> CoreResult<Value> {
    let author = match reply.author_id {
        Some(id) => directory.user(id).await?.map(serde_json::to_value).transpose()?,
        None => None,
    };
    let mut value = serde_json::to_value(reply)?;
    if let Value::Object(map) = &mut value {
        map.insert("created_at".to_string(), json!(iso_utc(&reply.created_at)));
        map.insert("author".to_string(), author.unwrap_or(Value::Null));
    }
    Ok(value)
}
