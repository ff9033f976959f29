//! Model listing: filtering, sorting and page slicing over descriptors.

use crate::error::LlmError;
use crate::types::{Capability, ModelDescriptor};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Newest first.
    #[default]
    Created,
    /// Most capabilities first.
    Capabilities,
    /// Lexicographic.
    Id,
}

impl FromStr for SortKey {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "created_at" | "date" => Ok(Self::Created),
            "capabilities" | "capabilities-count" | "capability_count" => Ok(Self::Capabilities),
            "id" | "name" => Ok(Self::Id),
            other => Err(LlmError::InvalidInput(format!("unknown sort key: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelQuery {
    pub sort_by: SortKey,
    /// 1-based; 0 is treated as 1.
    pub page: usize,
    pub page_size: usize,
    pub capability: Option<Capability>,
}

impl Default for ModelQuery {
    fn default() -> Self {
        Self {
            sort_by: SortKey::Created,
            page: 1,
            page_size: 20,
            capability: None,
        }
    }
}

impl ModelQuery {
    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort_by = key;
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }
}

/// Filter, sort and slice `models` according to `query`. Ties are broken by
/// id so the order is total and paging is stable between calls.
pub fn select(mut models: Vec<ModelDescriptor>, query: &ModelQuery) -> Vec<ModelDescriptor> {
    if let Some(capability) = query.capability {
        models.retain(|m| m.supports(capability));
    }

    match query.sort_by {
        SortKey::Created => {
            models.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)))
        }
        SortKey::Capabilities => models.sort_by(|a, b| {
            b.capabilities
                .len()
                .cmp(&a.capabilities.len())
                .then_with(|| a.id.cmp(&b.id))
        }),
        SortKey::Id => models.sort_by(|a, b| a.id.cmp(&b.id)),
    }

    let page = query.page.max(1);
    let start = (page - 1).saturating_mul(query.page_size);
    models
        .into_iter()
        .skip(start)
        .take(query.page_size)
        .collect()
}

/// Builds one row of a static fallback table. `created` is `YYYY-MM-DD`.
pub(crate) fn static_model(
    provider: &str,
    id: &str,
    display_name: &str,
    capabilities: &[Capability],
    context_length: u32,
    created: &str,
) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        display_name: display_name.to_string(),
        capabilities: capabilities.iter().copied().collect(),
        context_length,
        created_at: parse_day(created),
        provider: provider.to_string(),
    }
}

pub(crate) fn parse_day(day: &str) -> DateTime<Utc> {
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn from_unix(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn from_rfc3339(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
