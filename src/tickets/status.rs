use serde::{Deserialize, Serialize};

use crate::core::error::{CoreError, CoreResult};

/// Statuses that count as closed for reply matching and `closed_at`.
pub const CLOSED_STATUSES: [&str; 2] = ["resolved", "closed"];

pub fn is_closed_status(status: &str) -> bool {
    CLOSED_STATUSES.contains(&status)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDefinition {
    pub tech_status: String,
    pub tech_label: String,
    pub public_status: String,
}

impl StatusDefinition {
    fn builtin(tech: &str, label: &str, public: &str) -> Self {
        Self {
            tech_status: tech.to_string(),
            tech_label: label.to_string(),
            public_status: public.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSet {
    statuses: Vec<StatusDefinition>,
}

impl Default for StatusSet {
    fn default() -> Self {
        Self {
            statuses: vec![
                StatusDefinition::builtin("open", "Open", "Open"),
                StatusDefinition::builtin("in_progress", "In progress", "In progress"),
                StatusDefinition::builtin("waiting", "Waiting on customer", "Awaiting your reply"),
                StatusDefinition::builtin("resolved", "Resolved", "Resolved"),
                StatusDefinition::builtin("closed", "Closed", "Closed"),
            ],
        }
    }
}

impl StatusSet {
    /// Uses the configured list; falls back to the built-in set when empty.
    /// Entries whose slug fails normalisation are dropped.
    pub fn from_config(definitions: &[StatusDefinition]) -> Self {
        let statuses: Vec<StatusDefinition> = definitions
            .iter()
            .filter_map(|d| {
                normalise(&d.tech_status).ok().map(|slug| StatusDefinition {
                    tech_status: slug,
                    ..d.clone()
                })
            })
            .collect();
        if statuses.is_empty() {
            Self::default()
        } else {
            Self { statuses }
        }
    }

    pub fn definitions(&self) -> &[StatusDefinition] {
        &self.statuses
    }

    pub fn default_status(&self) -> String {
        self.statuses
            .first()
            .map(|s| s.tech_status.clone())
            .unwrap_or_else(|| "open".to_string())
    }

    /// Normalises `input` and checks it is one of the configured statuses.
    pub fn validate(&self, input: &str) -> CoreResult<String> {
        let slug = normalise(input)?;
        if self.statuses.iter().any(|s| s.tech_status == slug) {
            Ok(slug)
        } else {
            let known: Vec<&str> = self.statuses.iter().map(|s| s.tech_status.as_str()).collect();
            Err(CoreError::validation(format!(
                "Unknown status '{}'; expected one of: {}",
                input,
                known.join(", ")
            )))
        }
    }

    pub fn public_label(&self, status: &str) -> Option<&str> {
        self.statuses
            .iter()
            .find(|s| s.tech_status == status)
            .map(|s| s.public_status.as_str())
    }
}

/// Lowercases and rejects anything outside `[a-z0-9_-]`.
pub fn normalise(input: &str) -> CoreResult<String> {
    let slug = input.trim().to_lowercase();
    if slug.is_empty() {
        return Err(CoreError::validation("Status must not be empty"));
    }
    if let Some(bad) = slug
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
    {
        return Err(CoreError::validation(format!(
            "Status '{input}' contains invalid character '{bad}'"
        )));
    }
    Ok(slug)
}
