use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text, Timestamptz};

use super::dynamic::DynamicQuerySource;
use super::path::is_upper_identifier;
use super::source::{MessageTemplate, TemplateSource};
use crate::core::error::CoreResult;
use crate::core::shared::utils::{with_conn, DbPool};

#[derive(Clone)]
pub struct PgTemplateSource {
    pool: DbPool,
}

impl PgTemplateSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateSource for PgTemplateSource {
    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<MessageTemplate>> {
        use crate::core::shared::schema::message_templates::dsl::*;

        let reference = reference.to_string();
        with_conn(&self.pool, move |conn| {
            let exact = message_templates
                .filter(slug.eq(&reference))
                .select(MessageTemplate::as_select())
                .first(conn)
                .optional()?;
            if exact.is_some() || !is_upper_identifier(&reference) {
                return Ok(exact);
            }

            let all: Vec<MessageTemplate> = message_templates
                .select(MessageTemplate::as_select())
                .order(id.asc())
                .load(conn)?;
            Ok(all.into_iter().find(|t| t.answers_to(&reference)))
        })
        .await
    }
}

#[derive(Debug, QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(Debug, QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

/// Answers `count:`/`list:`/`ACTIVE_ASSETS` tokens from the asset tables.
#[derive(Clone)]
pub struct PgDynamicQuerySource {
    pool: DbPool,
}

impl PgDynamicQuerySource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn count(&self, sql: &'static str, arg: String) -> CoreResult<i64> {
        with_conn(&self.pool, move |conn| {
            let row: CountRow = diesel::sql_query(sql).bind::<Text, _>(arg).get_result(conn)?;
            Ok(row.count)
        })
        .await
    }

    async fn names(&self, sql: &'static str, arg: String) -> CoreResult<Vec<String>> {
        with_conn(&self.pool, move |conn| {
            let rows: Vec<NameRow> = diesel::sql_query(sql).bind::<Text, _>(arg).load(conn)?;
            Ok(rows.into_iter().map(|r| r.name).collect())
        })
        .await
    }
}

#[async_trait]
impl DynamicQuerySource for PgDynamicQuerySource {
    async fn count_assets_with_field(&self, field: &str) -> CoreResult<i64> {
        self.count(
            "SELECT COUNT(*) AS count FROM assets WHERE (custom_fields ->> $1) = 'true'",
            field.to_string(),
        )
        .await
    }

    async fn list_assets_with_field(&self, field: &str) -> CoreResult<Vec<String>> {
        self.names(
            "SELECT name FROM assets WHERE (custom_fields ->> $1) = 'true' ORDER BY name",
            field.to_string(),
        )
        .await
    }

    async fn count_issue_assets(&self, slug: &str) -> CoreResult<i64> {
        self.count(
            "SELECT COUNT(DISTINCT a.id) AS count FROM assets a \
             JOIN issue_assignments i ON i.asset_id = a.id WHERE i.issue_slug = $1",
            slug.to_string(),
        )
        .await
    }

    async fn list_issue_assets(&self, slug: &str) -> CoreResult<Vec<String>> {
        self.names(
            "SELECT DISTINCT a.name AS name FROM assets a \
             JOIN issue_assignments i ON i.asset_id = a.id WHERE i.issue_slug = $1 ORDER BY a.name",
            slug.to_string(),
        )
        .await
    }

    async fn count_active_assets(&self, since: DateTime<Utc>) -> CoreResult<i64> {
        with_conn(&self.pool, move |conn| {
            let row: CountRow = diesel::sql_query(
                "SELECT COUNT(*) AS count FROM assets WHERE is_active AND last_seen_at >= $1",
            )
            .bind::<Timestamptz, _>(since)
            .get_result(conn)?;
            Ok(row.count)
        })
        .await
    }
}
