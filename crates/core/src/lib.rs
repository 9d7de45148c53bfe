//! Fleet core types: catalog resources, agents, labels and selectors, change events.

#![forbid(unsafe_code)]

pub mod agent;
pub mod document;
pub mod error;
pub mod event;
pub mod labels;
pub mod resource;

pub use agent::{Agent, AgentStatus};
pub use document::{FieldEntry, Fields, Indexed};
pub use error::{Dependency, Error, Result};
pub use event::{Event, EventType, Events, Updates};
pub use labels::{Labels, Selector};
pub use resource::{
    AgentSelector, Configuration, ConfigurationSpec, Destination, DestinationSpec, DestinationType, Kind, Metadata,
    Object, Parameter, ParameterDefinition, ParameterType, Processor, ProcessorSpec, ProcessorType, Resource,
    ResourceConfiguration, ResourceStatus, ResourceTypeSpec, Source, SourceSpec, SourceType, UpdateStatus,
};

pub mod prelude {
    pub use super::{
        Agent, AgentStatus, Configuration, Event, EventType, Indexed, Kind, Labels, Resource, Selector, Updates,
    };
}

/// Paging, filtering and sorting for list operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub selector: Option<Selector>,
    pub query: Option<String>,
    pub offset: usize,
    /// Zero means no limit.
    pub limit: usize,
    /// Field name, `-` prefix for descending.
    pub sort: Option<String>,
}

impl QueryOptions {
    pub fn new() -> Self { Self::default() }
    pub fn with_selector(mut self, s: Selector) -> Self { self.selector = Some(s); self }
    pub fn with_query(mut self, q: impl Into<String>) -> Self { self.query = Some(q.into()); self }
    pub fn with_offset(mut self, offset: usize) -> Self { self.offset = offset; self }
    pub fn with_limit(mut self, limit: usize) -> Self { self.limit = limit; self }
    pub fn with_sort(mut self, sort: impl Into<String>) -> Self { self.sort = Some(sort.into()); self }

    /// `(field, descending)` for the requested sort or `default`.
    pub fn sort_key<'a>(&'a self, default: &'a str) -> (&'a str, bool) {
        match self.sort.as_deref() {
            Some(s) if s.starts_with('-') => (&s[1..], true),
            Some(s) if !s.is_empty() => (s, false),
            _ => (default, false),
        }
    }

    /// Apply offset and limit to an already filtered and sorted list.
    pub fn page<T>(&self, items: Vec<T>) -> Vec<T> {
        let it = items.into_iter().skip(self.offset);
        if self.limit == 0 { it.collect() } else { it.take(self.limit).collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_past_end_is_empty() {
        let items: Vec<u32> = (0..100).collect();
        let q = QueryOptions::new().with_offset(200).with_limit(10);
        assert!(q.page(items).is_empty());
    }

    #[test]
    fn sort_key_descending() {
        let q = QueryOptions::new().with_sort("-name");
        assert_eq!(q.sort_key("id"), ("name", true));
        assert_eq!(QueryOptions::new().sort_key("name"), ("name", false));
    }
}
