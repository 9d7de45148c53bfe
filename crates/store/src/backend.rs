//! Storage contract behind the resource store and the in-memory implementation.

use std::collections::BTreeMap;

use fleet_core::{Kind, Result};
use parking_lot::RwLock;
use serde_json::Value as Json;

/// One write in a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Put { kind: Kind, key: String, value: Json },
    Delete { kind: Kind, key: String },
}

impl Op {
    pub fn kind(&self) -> Kind {
        match self {
            Op::Put { kind, .. } | Op::Delete { kind, .. } => *kind,
        }
    }
}

/// Keyed JSON records per kind. `commit` applies every op of one mutation atomically.
pub trait Backend: Send + Sync {
    fn get(&self, kind: Kind, key: &str) -> Result<Option<Json>>;
    /// All records of `kind`, ordered by key.
    fn list(&self, kind: Kind) -> Result<Vec<(String, Json)>>;
    fn commit(&self, ops: &[Op]) -> Result<()>;
    fn name(&self) -> &'static str;
}

fn slot(kind: Kind) -> usize {
    match kind {
        Kind::Agent => 0,
        Kind::SourceType => 1,
        Kind::Source => 2,
        Kind::ProcessorType => 3,
        Kind::Processor => 4,
        Kind::DestinationType => 5,
        Kind::Destination => 6,
        Kind::Configuration => 7,
    }
}

/// Per-kind maps, each behind its own lock.
#[derive(Default)]
pub struct MemoryBackend {
    kinds: [RwLock<BTreeMap<String, Json>>; 8],
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }
}

impl Backend for MemoryBackend {
    fn get(&self, kind: Kind, key: &str) -> Result<Option<Json>> { Ok(self.kinds[slot(kind)].read().get(key).cloned()) }

    fn list(&self, kind: Kind) -> Result<Vec<(String, Json)>> {
        Ok(self.kinds[slot(kind)].read().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn commit(&self, ops: &[Op]) -> Result<()> {
        // Lock the touched kinds in a fixed order so concurrent commits cannot deadlock.
        let mut touched: Vec<usize> = ops.iter().map(|op| slot(op.kind())).collect();
        touched.sort_unstable();
        touched.dedup();
        let mut guards: Vec<_> = touched.iter().map(|i| (*i, self.kinds[*i].write())).collect();
        for op in ops {
            let Some((_, map)) = guards.iter_mut().find(|(i, _)| *i == slot(op.kind())) else { continue };
            match op {
                Op::Put { key, value, .. } => {
                    map.insert(key.clone(), value.clone());
                }
                Op::Delete { key, .. } => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str { "memory" }
}
