//! Sync context configuration

use std::collections::HashMap;

use crate::conflict_resolver::ConflictPolicy;
use crate::error::{Result, SyncError};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// An incremental query over one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullQuery {
    pub table: String,
    /// Service-side filter expression ANDed with the watermark clause
    pub filter: Option<String>,
    /// Key of the persisted delta token. Without one every pull is a full pull.
    pub query_id: Option<String>,
}

impl PullQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            query_id: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Records requested per pull page
    pub page_size: usize,

    pub conflict_policy: ConflictPolicy,

    /// Named pull queries. A named query without a query id tracks its
    /// progress under its name.
    pub queries: HashMap<String, PullQuery>,

    /// Client-wins resubmissions of one operation within a push cycle
    pub max_conflict_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            conflict_policy: ConflictPolicy::default(),
            queries: HashMap::new(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, query: PullQuery) -> Self {
        self.queries.insert(name.into(), query);
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Look up a named query, defaulting its query id to the name
    pub fn named_query(&self, name: &str) -> Result<PullQuery> {
        let query = self
            .queries
            .get(name)
            .ok_or_else(|| SyncError::UnknownQuery(name.to_string()))?;

        let mut query = query.clone();
        if query.query_id.is_none() {
            query.query_id = Some(name.to_string());
        }
        Ok(query)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(SyncError::InvalidConfig(format!(
                "page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.page_size
            )));
        }

        for (name, query) in &self.queries {
            if name.trim().is_empty() {
                return Err(SyncError::InvalidConfig(
                    "Pull query names cannot be empty".to_string(),
                ));
            }
            if let Some(query_id) = &query.query_id {
                validate_query_id(query_id)?;
            }
        }

        Ok(())
    }
}

/// Query ids become part of delta token keys
pub(crate) fn validate_query_id(query_id: &str) -> Result<()> {
    let valid = !query_id.is_empty()
        && query_id.len() <= 64
        && query_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if !valid {
        return Err(SyncError::InvalidConfig(format!(
            "Invalid query id '{}'",
            query_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.max_conflict_retries, 3);
        assert!(matches!(config.conflict_policy, ConflictPolicy::Abort));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_page_size_bounds() {
        assert!(SyncConfig::new().with_page_size(0).validate().is_err());
        assert!(SyncConfig::new().with_page_size(1).validate().is_ok());
        assert!(SyncConfig::new().with_page_size(1000).validate().is_ok());
        assert!(matches!(
            SyncConfig::new().with_page_size(1001).validate(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_named_query_defaults_query_id() {
        let config = SyncConfig::new()
            .with_query("open", PullQuery::new("todoitem").with_filter("complete eq false"))
            .with_query("all", PullQuery::new("todoitem").with_query_id("everything"));

        assert_eq!(
            config.named_query("open").unwrap().query_id.as_deref(),
            Some("open")
        );
        assert_eq!(
            config.named_query("all").unwrap().query_id.as_deref(),
            Some("everything")
        );
        assert!(matches!(
            config.named_query("missing"),
            Err(SyncError::UnknownQuery(_))
        ));
    }

    #[test]
    fn test_invalid_query_id() {
        let config = SyncConfig::new().with_query(
            "bad",
            PullQuery::new("todoitem").with_query_id("has space"),
        );
        assert!(config.validate().is_err());
    }
}
