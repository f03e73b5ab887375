use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text};

use super::directory::ContactDirectory;
use super::models::{
    Attachment, Company, NewAttachment, NewReply, NewTicket, Reply, StaffMember, Ticket, User,
    Watcher, WatcherTarget,
};
use super::repository::{SenderRef, TicketRepository};
use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::{ticket_attachments, ticket_replies, ticket_watchers, tickets};
use crate::core::shared::utils::{with_conn, DbPool};

const CANDIDATE_SQL: &str = "SELECT t.* FROM tickets t \
     WHERE t.status NOT IN ('resolved', 'closed') \
       AND (t.requester_id = $1 \
            OR EXISTS (SELECT 1 FROM ticket_watchers w \
                       WHERE w.ticket_id = t.id \
                         AND (w.user_id = $1 OR lower(w.email) = lower($2)))) \
     ORDER BY t.updated_at DESC, t.id DESC \
     LIMIT $3";

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ticket_watchers)]
struct NewWatcherRow {
    ticket_id: i64,
    user_id: Option<i64>,
    email: Option<String>,
}

pub struct PgTicketRepository {
    pool: DbPool,
}

impl PgTicketRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketRepository for PgTicketRepository {
    async fn get_ticket(&self, id: i64) -> CoreResult<Option<Ticket>> {
        with_conn(&self.pool, move |conn| {
            Ok(tickets::table
                .find(id)
                .select(Ticket::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn find_by_external_reference(&self, reference: &str) -> CoreResult<Option<Ticket>> {
        let reference = reference.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(tickets::table
                .filter(tickets::external_reference.eq(reference))
                .order(tickets::id.asc())
                .select(Ticket::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn find_reply_by_external_reference(&self, reference: &str) -> CoreResult<Option<Reply>> {
        let reference = reference.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(ticket_replies::table
                .filter(ticket_replies::external_reference.eq(reference))
                .order(ticket_replies::id.asc())
                .select(Reply::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn find_by_ticket_number(&self, number: &str) -> CoreResult<Option<Ticket>> {
        let number = number.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(tickets::table
                .filter(tickets::ticket_number.eq(number))
                .select(Ticket::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn candidate_tickets(&self, sender: &SenderRef, limit: i64) -> CoreResult<Vec<Ticket>> {
        let sender = sender.clone();
        with_conn(&self.pool, move |conn| {
            Ok(diesel::sql_query(CANDIDATE_SQL)
                .bind::<Nullable<BigInt>, _>(sender.user_id)
                .bind::<Text, _>(sender.email)
                .bind::<BigInt, _>(limit)
                .load::<Ticket>(conn)?)
        })
        .await
    }

    async fn create_ticket(&self, ticket: NewTicket) -> CoreResult<Ticket> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::insert_into(tickets::table)
                .values(&ticket)
                .returning(Ticket::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn update_status(
        &self,
        id: i64,
        status: &str,
        closed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CoreResult<Ticket> {
        let status = status.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::update(tickets::table.find(id))
                .set((
                    tickets::status.eq(status),
                    tickets::closed_at.eq(closed_at),
                    tickets::updated_at.eq(now),
                ))
                .returning(Ticket::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| CoreError::not_found(format!("Ticket {id}")))
        })
        .await
    }

    async fn create_reply(&self, reply: NewReply) -> CoreResult<Reply> {
        with_conn(&self.pool, move |conn| {
            conn.transaction::<_, CoreError, _>(|conn| {
                let bumped = diesel::update(tickets::table.find(reply.ticket_id))
                    .set(tickets::updated_at.eq(Utc::now()))
                    .execute(conn)?;
                if bumped == 0 {
                    return Err(CoreError::not_found(format!("Ticket {}", reply.ticket_id)));
                }
                Ok(diesel::insert_into(ticket_replies::table)
                    .values(&reply)
                    .returning(Reply::as_returning())
                    .get_result(conn)?)
            })
        })
        .await
    }

    async fn replies(&self, ticket_id: i64) -> CoreResult<Vec<Reply>> {
        with_conn(&self.pool, move |conn| {
            Ok(ticket_replies::table
                .filter(ticket_replies::ticket_id.eq(ticket_id))
                .order((ticket_replies::created_at.asc(), ticket_replies::id.asc()))
                .select(Reply::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn merge_tickets(&self, source: i64, target: i64, now: DateTime<Utc>) -> CoreResult<usize> {
        with_conn(&self.pool, move |conn| {
            conn.transaction::<_, CoreError, _>(|conn| {
                let touched = diesel::update(tickets::table.find(target))
                    .set(tickets::updated_at.eq(now))
                    .execute(conn)?;
                if touched == 0 {
                    return Err(CoreError::not_found(format!("Ticket {target}")));
                }
                let marked = diesel::update(tickets::table.find(source))
                    .set((
                        tickets::merged_into_ticket_id.eq(Some(target)),
                        tickets::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                if marked == 0 {
                    return Err(CoreError::not_found(format!("Ticket {source}")));
                }
                Ok(diesel::update(
                    ticket_replies::table.filter(ticket_replies::ticket_id.eq(source)),
                )
                .set(ticket_replies::ticket_id.eq(target))
                .execute(conn)?)
            })
        })
        .await
    }

    async fn split_ticket(
        &self,
        source: i64,
        ticket: NewTicket,
        reply_ids: &[i64],
    ) -> CoreResult<Ticket> {
        let reply_ids = reply_ids.to_vec();
        with_conn(&self.pool, move |conn| {
            conn.transaction::<_, CoreError, _>(|conn| {
                let owned: i64 = ticket_replies::table
                    .filter(ticket_replies::ticket_id.eq(source))
                    .filter(ticket_replies::id.eq_any(&reply_ids))
                    .count()
                    .get_result(conn)?;
                if owned as usize != reply_ids.len() {
                    return Err(CoreError::validation(format!(
                        "Some replies do not belong to ticket {source}"
                    )));
                }
                let created: Ticket = diesel::insert_into(tickets::table)
                    .values(&ticket)
                    .returning(Ticket::as_returning())
                    .get_result(conn)?;
                diesel::update(ticket_replies::table.filter(ticket_replies::id.eq_any(&reply_ids)))
                    .set(ticket_replies::ticket_id.eq(created.id))
                    .execute(conn)?;
                Ok(created)
            })
        })
        .await
    }

    async fn add_watcher(&self, ticket_id: i64, target: &WatcherTarget) -> CoreResult<bool> {
        let target = target.clone();
        with_conn(&self.pool, move |conn| {
            let existing: Vec<Watcher> = ticket_watchers::table
                .filter(ticket_watchers::ticket_id.eq(ticket_id))
                .select(Watcher::as_select())
                .load(conn)?;
            if existing.iter().any(|w| w.is(&target)) {
                return Ok(false);
            }
            let row = match target {
                WatcherTarget::User(user_id) => NewWatcherRow {
                    ticket_id,
                    user_id: Some(user_id),
                    email: None,
                },
                WatcherTarget::Email(email) => NewWatcherRow {
                    ticket_id,
                    user_id: None,
                    email: Some(email),
                },
            };
            diesel::insert_into(ticket_watchers::table)
                .values(&row)
                .execute(conn)?;
            Ok(true)
        })
        .await
    }

    async fn watchers(&self, ticket_id: i64) -> CoreResult<Vec<Watcher>> {
        with_conn(&self.pool, move |conn| {
            Ok(ticket_watchers::table
                .filter(ticket_watchers::ticket_id.eq(ticket_id))
                .order(ticket_watchers::id.asc())
                .select(Watcher::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn add_attachment(&self, attachment: NewAttachment) -> CoreResult<Attachment> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::insert_into(ticket_attachments::table)
                .values(&attachment)
                .returning(Attachment::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn attachments(&self, ticket_id: i64) -> CoreResult<Vec<Attachment>> {
        with_conn(&self.pool, move |conn| {
            Ok(ticket_attachments::table
                .filter(ticket_attachments::ticket_id.eq(ticket_id))
                .order(ticket_attachments::id.asc())
                .select(Attachment::as_select())
                .load(conn)?)
        })
        .await
    }
}

pub struct PgContactDirectory {
    pool: DbPool,
}

impl PgContactDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactDirectory for PgContactDirectory {
    async fn user(&self, id: i64) -> CoreResult<Option<User>> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::sql_query("SELECT * FROM users WHERE id = $1")
                .bind::<BigInt, _>(id)
                .get_result::<User>(conn)
                .optional()?)
        })
        .await
    }

    async fn user_by_email(&self, email: &str) -> CoreResult<Option<User>> {
        let email = email.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(
                diesel::sql_query("SELECT * FROM users WHERE lower(email) = lower($1) ORDER BY id LIMIT 1")
                    .bind::<Text, _>(email)
                    .get_result::<User>(conn)
                    .optional()?,
            )
        })
        .await
    }

    async fn company(&self, id: i64) -> CoreResult<Option<Company>> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::sql_query("SELECT * FROM companies WHERE id = $1")
                .bind::<BigInt, _>(id)
                .get_result::<Company>(conn)
                .optional()?)
        })
        .await
    }

    async fn company_by_domain(&self, domain: &str) -> CoreResult<Option<Company>> {
        let domain = domain.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(diesel::sql_query(
                "SELECT * FROM companies WHERE lower(email_domain) = lower($1) ORDER BY id LIMIT 1",
            )
            .bind::<Text, _>(domain)
            .get_result::<Company>(conn)
            .optional()?)
        })
        .await
    }

    async fn staff_by_email(&self, company_id: i64, email: &str) -> CoreResult<Option<StaffMember>> {
        let email = email.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(diesel::sql_query(
                "SELECT * FROM company_staff \
                 WHERE company_id = $1 AND lower(email) = lower($2) ORDER BY id LIMIT 1",
            )
            .bind::<BigInt, _>(company_id)
            .bind::<Text, _>(email)
            .get_result::<StaffMember>(conn)
            .optional()?)
        })
        .await
    }

    async fn is_known_sender(&self, email: &str) -> CoreResult<bool> {
        let email = email.to_string();
        with_conn(&self.pool, move |conn| {
            let row: CountRow = diesel::sql_query(
                "SELECT (SELECT COUNT(*) FROM users WHERE lower(email) = lower($1)) \
                      + (SELECT COUNT(*) FROM company_staff WHERE lower(email) = lower($1)) AS count",
            )
            .bind::<Text, _>(email)
            .get_result(conn)?;
            Ok(row.count > 0)
        })
        .await
    }
}
