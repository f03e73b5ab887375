//! Tokens whose value comes from a repository query at render time.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use log::warn;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::core::error::CoreResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DynamicQuery {
    CountAssets(String),
    ListAssets(String),
    CountIssue(String),
    ListIssue(String),
    /// `None` counts from the first of the current month.
    ActiveAssets(Option<u32>),
}

impl DynamicQuery {
    /// Keyword prefixes match case-insensitively; the field or slug keeps its casing.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("ACTIVE_ASSETS") {
            return Some(Self::ActiveAssets(None));
        }

        let mut parts = name.splitn(3, ':');
        let first = parts.next()?;
        let second = parts.next()?;
        if first.eq_ignore_ascii_case("ACTIVE_ASSETS") {
            if parts.next().is_some() {
                return None;
            }
            return second.parse::<u32>().ok().map(|n| Self::ActiveAssets(Some(n)));
        }

        let target = parts.next().filter(|t| !t.is_empty())?;
        let target = target.to_string();
        match (
            first.to_ascii_lowercase().as_str(),
            second.to_ascii_lowercase().as_str(),
        ) {
            ("count", "asset") => Some(Self::CountAssets(target)),
            ("list", "asset") => Some(Self::ListAssets(target)),
            ("count", "issue") => Some(Self::CountIssue(target)),
            ("list", "issue") => Some(Self::ListIssue(target)),
            _ => None,
        }
    }

    /// Canonical token-map key.
    pub fn key(&self) -> String {
        match self {
            Self::CountAssets(field) => format!("count:asset:{field}"),
            Self::ListAssets(field) => format!("list:asset:{field}"),
            Self::CountIssue(slug) => format!("count:issue:{slug}"),
            Self::ListIssue(slug) => format!("list:issue:{slug}"),
            Self::ActiveAssets(None) => "ACTIVE_ASSETS".to_string(),
            Self::ActiveAssets(Some(days)) => format!("ACTIVE_ASSETS:{days}"),
        }
    }

    pub fn since(days: Option<u32>, now: DateTime<Utc>) -> DateTime<Utc> {
        match days {
            Some(days) => now - Duration::days(i64::from(days)),
            None => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(now),
        }
    }
}

#[async_trait]
pub trait DynamicQuerySource: Send + Sync {
    async fn count_assets_with_field(&self, field: &str) -> CoreResult<i64>;
    async fn list_assets_with_field(&self, field: &str) -> CoreResult<Vec<String>>;
    async fn count_issue_assets(&self, slug: &str) -> CoreResult<i64>;
    async fn list_issue_assets(&self, slug: &str) -> CoreResult<Vec<String>>;
    async fn count_active_assets(&self, since: DateTime<Utc>) -> CoreResult<i64>;
}

async fn run_query(
    source: &dyn DynamicQuerySource,
    query: &DynamicQuery,
    now: DateTime<Utc>,
) -> CoreResult<Value> {
    Ok(match query {
        DynamicQuery::CountAssets(field) => Value::from(source.count_assets_with_field(field).await?),
        DynamicQuery::ListAssets(field) => {
            Value::String(source.list_assets_with_field(field).await?.join(", "))
        }
        DynamicQuery::CountIssue(slug) => Value::from(source.count_issue_assets(slug).await?),
        DynamicQuery::ListIssue(slug) => {
            Value::String(source.list_issue_assets(slug).await?.join(", "))
        }
        DynamicQuery::ActiveAssets(days) => Value::from(
            source
                .count_active_assets(DynamicQuery::since(*days, now))
                .await?,
        ),
    })
}

/// Resolves every distinct query once. Failed queries are left out of the map.
pub async fn resolve_batch(
    source: &dyn DynamicQuerySource,
    queries: &[DynamicQuery],
    now: DateTime<Utc>,
) -> HashMap<String, Value> {
    let mut resolved = HashMap::new();
    let mut seen = HashSet::new();
    for query in queries {
        if !seen.insert(query.key()) {
            continue;
        }
        match run_query(source, query, now).await {
            Ok(value) => {
                resolved.insert(query.key(), value);
            }
            Err(e) => warn!("Dynamic token {} could not be resolved: {}", query.key(), e),
        }
    }
    resolved
}

#[derive(Debug, Clone)]
pub struct AssetRecord {
    pub name: String,
    pub is_active: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub custom_fields: Value,
    pub issues: Vec<String>,
}

/// In-process query source used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryDynamicQuerySource {
    pub assets: Vec<AssetRecord>,
}

impl MemoryDynamicQuerySource {
    fn with_field(&self, field: &str) -> impl Iterator<Item = &AssetRecord> + '_ {
        let field = field.to_string();
        self.assets
            .iter()
            .filter(move |a| a.custom_fields.get(&field).and_then(Value::as_bool) == Some(true))
    }

    fn with_issue(&self, slug: &str) -> impl Iterator<Item = &AssetRecord> + '_ {
        let slug = slug.to_string();
        self.assets.iter().filter(move |a| a.issues.contains(&slug))
    }
}

#[async_trait]
impl DynamicQuerySource for MemoryDynamicQuerySource {
    async fn count_assets_with_field(&self, field: &str) -> CoreResult<i64> {
        Ok(self.with_field(field).count() as i64)
    }

    async fn list_assets_with_field(&self, field: &str) -> CoreResult<Vec<String>> {
        Ok(self.with_field(field).map(|a| a.name.clone()).collect())
    }

    async fn count_issue_assets(&self, slug: &str) -> CoreResult<i64> {
        Ok(self.with_issue(slug).count() as i64)
    }

    async fn list_issue_assets(&self, slug: &str) -> CoreResult<Vec<String>> {
        Ok(self.with_issue(slug).map(|a| a.name.clone()).collect())
    }

    async fn count_active_assets(&self, since: DateTime<Utc>) -> CoreResult<i64> {
        Ok(self
            .assets
            .iter()
            .filter(|a| a.is_active && a.last_seen_at.is_some_and(|seen| seen >= since))
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_keeps_field_casing() {
        assert_eq!(
            DynamicQuery::parse("COUNT:Asset:HasAV"),
            Some(DynamicQuery::CountAssets("HasAV".into()))
        );
        assert_eq!(
            DynamicQuery::parse("list:issue:disk-full").map(|q| q.key()),
            Some("list:issue:disk-full".to_string())
        );
        assert_eq!(DynamicQuery::parse("active_assets"), Some(DynamicQuery::ActiveAssets(None)));
        assert_eq!(
            DynamicQuery::parse("ACTIVE_ASSETS:30"),
            Some(DynamicQuery::ActiveAssets(Some(30)))
        );
        assert_eq!(DynamicQuery::parse("ACTIVE_ASSETS:-1"), None);
        assert_eq!(DynamicQuery::parse("count:asset:"), None);
        assert_eq!(DynamicQuery::parse("ticket.subject"), None);
    }

    #[test]
    fn test_since_boundaries() {
        let now = Utc.with_ymd_and_hms(2024, 3, 17, 10, 5, 0).unwrap();
        assert_eq!(DynamicQuery::since(Some(0), now), now);
        assert_eq!(
            DynamicQuery::since(None, now),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            DynamicQuery::since(Some(7), now),
            Utc.with_ymd_and_hms(2024, 3, 10, 10, 5, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_batch_against_memory_source() {
        let now = Utc.with_ymd_and_hms(2024, 3, 17, 10, 0, 0).unwrap();
        let source = MemoryDynamicQuerySource {
            assets: vec![
                AssetRecord {
                    name: "PC-01".into(),
                    is_active: true,
                    last_seen_at: Some(now - Duration::days(2)),
                    custom_fields: json!({"av": true}),
                    issues: vec!["disk-full".into()],
                },
                AssetRecord {
                    name: "PC-02".into(),
                    is_active: true,
                    last_seen_at: Some(now - Duration::days(40)),
                    custom_fields: json!({"av": true}),
                    issues: vec![],
                },
                AssetRecord {
                    name: "PC-03".into(),
                    is_active: false,
                    last_seen_at: Some(now),
                    custom_fields: json!({"av": false}),
                    issues: vec!["disk-full".into()],
                },
            ],
        };
        let queries = vec![
            DynamicQuery::CountAssets("av".into()),
            DynamicQuery::ListAssets("av".into()),
            DynamicQuery::ListIssue("disk-full".into()),
            DynamicQuery::ActiveAssets(None),
            DynamicQuery::ActiveAssets(Some(7)),
        ];
        let resolved = resolve_batch(&source, &queries, now).await;
        assert_eq!(resolved["count:asset:av"], json!(2));
        assert_eq!(resolved["list:asset:av"], json!("PC-01, PC-02"));
        assert_eq!(resolved["list:issue:disk-full"], json!("PC-01, PC-03"));
        assert_eq!(resolved["ACTIVE_ASSETS"], json!(1));
        assert_eq!(resolved["ACTIVE_ASSETS:7"], json!(1));
    }
}
