//! NIP-01 filters.
//!
//! A filter is a predicate over events. An absent field places no constraint
//! on its dimension; `ids` and `authors` match by prefix; tag constraints are
//! carried under `"#x"` keys and match any listed value.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Query predicate over events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag constraints, keyed `"#x"`. Keys always begin with `#`; anything
    /// else arriving here is ignored by [`Filter::matches`].
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Filter that matches everything from a point in time forward.
    pub fn since(timestamp: u64) -> Self {
        Filter {
            since: Some(timestamp),
            ..Default::default()
        }
    }

    /// Tag constraints, with the leading `#` stripped from each key.
    pub fn tag_constraints(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tags
            .iter()
            .filter_map(|(k, v)| k.strip_prefix('#').map(|name| (name, v.as_slice())))
    }

    /// Whether an event satisfies every constraint of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| event.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, values) in self.tag_constraints() {
            let mut hit = false;
            for value in event.tag_values(name) {
                if values.iter().any(|v| v == value) {
                    hit = true;
                    break;
                }
            }
            if !hit {
                return false;
            }
        }
        true
    }
}
