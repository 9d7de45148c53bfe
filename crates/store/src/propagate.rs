//! Transitive expansion of an `Updates` batch to the resources affected by its changes.

use fleet_core::{EventType, Kind, Resource, Result, Updates};

use crate::ResourceStore;

impl ResourceStore {
    /// Pull in every resource whose effective definition changed because something it
    /// uses is in `updates`. Entries already in the batch are left as they are.
    pub(crate) fn expand(&self, updates: &mut Updates) -> Result<()> {
        if updates.len() == updates.agents.len() {
            return Ok(());
        }
        let sources = self.resources(Kind::Source)?;

        // source types -> sources of that type
        if !updates.source_types.is_empty() {
            for r in sources.iter() {
                if let Resource::Source(s) = r {
                    if updates.source_types.contains_key(&s.spec.kind) {
                        updates.include_resource_if_absent(r.clone(), EventType::Update);
                    }
                }
            }
        }

        // processor types -> processors of that type and sources embedding the type
        if !updates.processor_types.is_empty() {
            for r in self.resources(Kind::Processor)? {
                if let Resource::Processor(p) = &r {
                    if updates.processor_types.contains_key(&p.spec.kind) {
                        updates.include_resource_if_absent(r.clone(), EventType::Update);
                    }
                }
            }
            for r in sources.iter() {
                if let Resource::Source(s) = r {
                    if s.processor_types().any(|t| updates.processor_types.contains_key(t)) {
                        updates.include_resource_if_absent(r.clone(), EventType::Update);
                    }
                }
            }
        }

        // processors -> sources embedding them
        if !updates.processors.is_empty() {
            for r in sources.iter() {
                if let Resource::Source(s) = r {
                    if s.processor_names().any(|n| updates.processors.contains_key(n)) {
                        updates.include_resource_if_absent(r.clone(), EventType::Update);
                    }
                }
            }
        }

        // destination types -> destinations of that type
        if !updates.destination_types.is_empty() {
            for r in self.resources(Kind::Destination)? {
                if let Resource::Destination(d) = &r {
                    if updates.destination_types.contains_key(&d.spec.kind) {
                        updates.include_resource_if_absent(r.clone(), EventType::Update);
                    }
                }
            }
        }

        // configurations referring to anything above
        for r in self.resources(Kind::Configuration)? {
            let Resource::Configuration(c) = &r else { continue };
            if updates.configurations.contains_key(c.name()) {
                continue;
            }
            let affected = c.source_names().any(|n| updates.sources.contains_key(n))
                || c.source_types().any(|t| updates.source_types.contains_key(t))
                || c.destination_names().any(|n| updates.destinations.contains_key(n))
                || c.destination_types().any(|t| updates.destination_types.contains_key(t));
            if affected {
                updates.include_resource(r.clone(), EventType::Update);
            }
        }
        Ok(())
    }
}
