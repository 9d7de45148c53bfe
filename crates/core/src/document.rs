//! Projection of catalog entities into search documents.
//!
//! Each indexed entity yields named, possibly repeated, field values plus its labels.

use smallvec::SmallVec;

use crate::agent::Agent;
use crate::labels::Labels;
use crate::resource::{Configuration, Resource};

/// Entry representing a projected field: `(name, value)`.
pub type FieldEntry = (&'static str, String);

pub type Fields = SmallVec<[FieldEntry; 8]>;

/// Entity that can be indexed by the search index.
pub trait Indexed {
    /// Document id, unique within one index.
    fn index_id(&self) -> &str;
    /// Searchable fields. Empty values are skipped by the index.
    fn index_fields(&self) -> Fields;
    fn index_labels(&self) -> &Labels;
}

impl Indexed for Agent {
    fn index_id(&self) -> &str { &self.id }

    fn index_fields(&self) -> Fields {
        let mut f = Fields::new();
        f.push(("id", self.id.clone()));
        f.push(("name", self.name.clone()));
        f.push(("version", self.version.clone()));
        f.push(("platform", self.platform.clone()));
        f.push(("os", self.operating_system.clone()));
        f.push(("arch", self.architecture.clone()));
        f.push(("hostname", self.hostname.clone()));
        f.push(("macAddress", self.mac_address.clone()));
        f.push(("remoteAddress", self.remote_address.clone()));
        f.push(("status", self.status.as_str().to_string()));
        if let Some(c) = self.configuration_name() {
            f.push(("configuration", c.to_string()));
        }
        f
    }

    fn index_labels(&self) -> &Labels { &self.labels }
}

impl Indexed for Configuration {
    fn index_id(&self) -> &str { self.name() }

    fn index_fields(&self) -> Fields {
        let mut f = Fields::new();
        f.push(("name", self.name().to_string()));
        if let Some(d) = &self.metadata.description { f.push(("description", d.clone())); }
        f.extend(self.source_names().map(|n| ("source", n.to_string())));
        f.extend(self.source_types().map(|t| ("sourceType", t.to_string())));
        f.extend(self.processor_names().map(|n| ("processor", n.to_string())));
        f.extend(self.processor_types().map(|t| ("processorType", t.to_string())));
        f.extend(self.destination_names().map(|n| ("destination", n.to_string())));
        f.extend(self.destination_types().map(|t| ("destinationType", t.to_string())));
        f.extend(
            self.spec
                .selector
                .match_labels
                .iter()
                .map(|(k, v)| ("selector", format!("{}={}", k, v))),
        );
        f
    }

    fn index_labels(&self) -> &Labels { &self.metadata.labels }
}

impl Indexed for Resource {
    fn index_id(&self) -> &str { self.name() }

    fn index_fields(&self) -> Fields {
        match self {
            Resource::Configuration(c) => c.index_fields(),
            Resource::Source(s) => {
                let mut f = Fields::new();
                f.push(("name", s.name().to_string()));
                f.push(("type", s.spec.kind.clone()));
                f
            }
            Resource::Processor(p) => {
                let mut f = Fields::new();
                f.push(("name", p.name().to_string()));
                f.push(("type", p.spec.kind.clone()));
                f
            }
            Resource::Destination(d) => {
                let mut f = Fields::new();
                f.push(("name", d.name().to_string()));
                f.push(("type", d.spec.kind.clone()));
                f
            }
            Resource::SourceType(t) | Resource::ProcessorType(t) | Resource::DestinationType(t) => {
                let mut f = Fields::new();
                f.push(("name", t.name().to_string()));
                f.extend(t.spec.supported_platforms.iter().map(|p| ("platform", p.clone())));
                f
            }
        }
    }

    fn index_labels(&self) -> &Labels { self.labels() }
}
