//! Lookup key grammar
//!
//! Every cacheable lookup shape owns its key construction here, so the
//! string grammar lives in exactly one place and round-trips through
//! `parse` for the preload planner.

use serde::{Deserialize, Serialize};

use crate::local::{NS_AGGREGATE, NS_CATEGORY, NS_DETAIL, NS_LIST};

/// The lookup shapes the cache understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LookupKey {
    /// Paginated list of records
    List {
        /// 1-based page number
        page: u32,
        /// Records per page
        page_size: u32,
    },
    /// Single record by identity
    Detail {
        /// Record identity
        id: u64,
    },
    /// Paginated list within one category
    Category {
        /// Category name
        name: String,
        /// 1-based page number
        page: u32,
        /// Records per page
        page_size: u32,
    },
    /// Named aggregate (hot records, counters, rollups)
    Aggregate {
        /// Aggregate name
        name: String,
    },
}

impl LookupKey {
    /// Logical cache key for this lookup.
    pub fn cache_key(&self) -> String {
        match self {
            Self::List { page, page_size } => format!("list:{}:{}", page, page_size),
            Self::Detail { id } => format!("detail:{}", id),
            Self::Category { name, page, page_size } => {
                format!("category:{}:{}:{}", name, page, page_size)
            }
            Self::Aggregate { name } => format!("agg:{}", name),
        }
    }

    /// Local-tier namespace this lookup caches under.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::List { .. } => NS_LIST,
            Self::Detail { .. } => NS_DETAIL,
            Self::Category { .. } => NS_CATEGORY,
            Self::Aggregate { .. } => NS_AGGREGATE,
        }
    }

    /// Parse a cache key back into its lookup shape.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.splitn(2, ':');
        let kind = parts.next()?;
        let rest = parts.next()?;

        match kind {
            "list" => {
                let mut fields = rest.split(':');
                let page = fields.next()?.parse().ok()?;
                let page_size = fields.next()?.parse().ok()?;
                fields.next().is_none().then_some(Self::List { page, page_size })
            }
            "detail" => {
                let id = rest.parse().ok()?;
                Some(Self::Detail { id })
            }
            "category" => {
                // Category names may themselves contain ':'; page fields
                // are the last two segments
                let fields: Vec<&str> = rest.rsplitn(3, ':').collect();
                if fields.len() != 3 {
                    return None;
                }
                let page_size = fields[0].parse().ok()?;
                let page = fields[1].parse().ok()?;
                Some(Self::Category {
                    name: fields[2].to_string(),
                    page,
                    page_size,
                })
            }
            "agg" => Some(Self::Aggregate {
                name: rest.to_string(),
            }),
            _ => None,
        }
    }
}

/// Shape of a cached value: a single record or a page of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload<E> {
    /// One record
    One(E),
    /// A page of records
    Many(Vec<E>),
}

// =============================================================================
// Tests
// =============================================================================
