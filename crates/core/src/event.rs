//! Change events and the per-mutation `Updates` batch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::resource::{
    Configuration, Destination, DestinationType, Kind, Processor, ProcessorType, Resource, Source, SourceType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Insert = 1,
    Update = 2,
    Remove = 3,
    /// An update that changed the agent's labels.
    Label = 4,
}

impl EventType {
    /// Type of two successive events for one entity folded together. `Remove` is final
    /// unless the entity comes back, and a label change survives later plain updates.
    pub fn coalesce(self, later: EventType) -> EventType {
        match (self, later) {
            (_, EventType::Remove) => EventType::Remove,
            (EventType::Remove, later) => later,
            (EventType::Label, _) | (_, EventType::Label) => EventType::Label,
            (EventType::Insert, _) => EventType::Insert,
            (_, later) => later,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub item: T,
}

/// Events for one kind keyed by unique key (agent id or resource name).
pub type Events<T> = BTreeMap<String, Event<T>>;

/// One coalesced batch of events emitted per store mutation. Each entity appears at most
/// once; a later inclusion with the same key replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Updates {
    #[serde(default)]
    pub agents: Events<Agent>,
    #[serde(default)]
    pub source_types: Events<SourceType>,
    #[serde(default)]
    pub sources: Events<Source>,
    #[serde(default)]
    pub processor_types: Events<ProcessorType>,
    #[serde(default)]
    pub processors: Events<Processor>,
    #[serde(default)]
    pub destination_types: Events<DestinationType>,
    #[serde(default)]
    pub destinations: Events<Destination>,
    #[serde(default)]
    pub configurations: Events<Configuration>,
}

fn put<T>(events: &mut Events<T>, key: &str, event_type: EventType, item: T) {
    events.insert(key.to_string(), Event { event_type, item });
}

/// Later items win; event types coalesce.
fn fold<T>(events: &mut Events<T>, other: Events<T>) {
    for (key, mut event) in other {
        if let Some(prev) = events.get(&key) {
            event.event_type = prev.event_type.coalesce(event.event_type);
        }
        events.insert(key, event);
    }
}

impl Updates {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn len(&self) -> usize {
        self.agents.len()
            + self.source_types.len()
            + self.sources.len()
            + self.processor_types.len()
            + self.processors.len()
            + self.destination_types.len()
            + self.destinations.len()
            + self.configurations.len()
    }

    pub fn include_agent(&mut self, agent: Agent, event_type: EventType) {
        let key = agent.id.clone();
        put(&mut self.agents, &key, event_type, agent);
    }

    pub fn include_resource(&mut self, resource: Resource, event_type: EventType) {
        let key = resource.name().to_string();
        match resource {
            Resource::SourceType(r) => put(&mut self.source_types, &key, event_type, r),
            Resource::Source(r) => put(&mut self.sources, &key, event_type, r),
            Resource::ProcessorType(r) => put(&mut self.processor_types, &key, event_type, r),
            Resource::Processor(r) => put(&mut self.processors, &key, event_type, r),
            Resource::DestinationType(r) => put(&mut self.destination_types, &key, event_type, r),
            Resource::Destination(r) => put(&mut self.destinations, &key, event_type, r),
            Resource::Configuration(r) => put(&mut self.configurations, &key, event_type, r),
        }
    }

    /// Include only if no event for the same entity is already present.
    pub fn include_resource_if_absent(&mut self, resource: Resource, event_type: EventType) -> bool {
        if self.contains(resource.kind(), resource.name()) {
            return false;
        }
        self.include_resource(resource, event_type);
        true
    }

    pub fn contains(&self, kind: Kind, key: &str) -> bool {
        match kind {
            Kind::Agent => self.agents.contains_key(key),
            Kind::SourceType => self.source_types.contains_key(key),
            Kind::Source => self.sources.contains_key(key),
            Kind::ProcessorType => self.processor_types.contains_key(key),
            Kind::Processor => self.processors.contains_key(key),
            Kind::DestinationType => self.destination_types.contains_key(key),
            Kind::Destination => self.destinations.contains_key(key),
            Kind::Configuration => self.configurations.contains_key(key),
        }
    }

    /// Fold a later batch into this one. Items from `other` win, event types follow
    /// `EventType::coalesce`.
    pub fn merge(&mut self, other: Updates) {
        fold(&mut self.agents, other.agents);
        fold(&mut self.source_types, other.source_types);
        fold(&mut self.sources, other.sources);
        fold(&mut self.processor_types, other.processor_types);
        fold(&mut self.processors, other.processors);
        fold(&mut self.destination_types, other.destination_types);
        fold(&mut self.destinations, other.destinations);
        fold(&mut self.configurations, other.configurations);
    }

    /// Keep only the agent events; `None` when nothing remains.
    pub fn only_agents(&self) -> Option<Updates> {
        if self.agents.is_empty() {
            return None;
        }
        Some(Updates { agents: self.agents.clone(), ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SourceSpec;

    #[test]
    fn later_inclusion_overrides() {
        let mut u = Updates::new();
        u.include_agent(Agent::new("a"), EventType::Insert);
        u.include_agent(Agent::new("a"), EventType::Label);
        assert_eq!(u.len(), 1);
        assert_eq!(u.agents["a"].event_type, EventType::Label);
    }

    #[test]
    fn merge_keeps_label_and_remove() {
        let batch = |t: EventType, host: &str| {
            let mut a = Agent::new("a");
            a.hostname = host.to_string();
            let mut u = Updates::new();
            u.include_agent(a, t);
            u
        };
        let mut u = batch(EventType::Label, "h1");
        u.merge(batch(EventType::Update, "h2"));
        assert_eq!(u.agents["a"].event_type, EventType::Label);
        assert_eq!(u.agents["a"].item.hostname, "h2");

        u.merge(batch(EventType::Remove, "h2"));
        assert_eq!(u.agents["a"].event_type, EventType::Remove);
        u.merge(batch(EventType::Insert, "h3"));
        assert_eq!(u.agents["a"].event_type, EventType::Insert);
        u.merge(batch(EventType::Update, "h3"));
        assert_eq!(u.agents["a"].event_type, EventType::Insert);
    }

    #[test]
    fn if_absent_keeps_first() {
        let mut u = Updates::new();
        let s: Resource = Source::new("s1", SourceSpec { kind: "macos".into(), ..Default::default() }).into();
        u.include_resource(s.clone(), EventType::Remove);
        assert!(!u.include_resource_if_absent(s, EventType::Update));
        assert_eq!(u.sources["s1"].event_type, EventType::Remove);
        assert!(u.contains(Kind::Source, "s1"));
        assert!(u.only_agents().is_none());
    }
}
