//! Fleet apply: YAML resource parsing with size budgets, dry-run planning and seeding.

#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use anyhow::Context;
use fleet_core::resource::API_VERSION;
use fleet_core::{Error, Kind, Resource, Result};
use fleet_store::ResourceStore;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

/// Folders under the seed directory applied on startup, in order.
pub const SEED_FOLDERS: [&str; 2] = ["source-types", "destination-types"];

fn max_yaml_bytes() -> usize {
    std::env::var("FLEET_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("FLEET_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse every document of a multi-document YAML stream. Empty documents are skipped.
pub fn parse_resources(yaml: &str) -> Result<Vec<Resource>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(Error::Invalid(format!("YAML payload too large (>{} bytes)", max_yaml_bytes())));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc)
            .map_err(|e| Error::Invalid(format!("document {}: parsing YAML: {}", i + 1, e)))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val)
            .map_err(|e| Error::Invalid(format!("document {}: converting YAML to JSON: {}", i + 1, e)))?;
        out.push(resource_from_json(json).map_err(|e| match e {
            Error::Invalid(msg) => Error::Invalid(format!("document {}: {}", i + 1, msg)),
            other => other,
        })?);
    }
    Ok(out)
}

/// Dispatch one decoded document on its `kind`.
pub fn resource_from_json(mut json: Json) -> Result<Resource> {
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(Error::Invalid(format!("document too complex (>{} nodes)", max_yaml_nodes())));
    }
    let kind_s = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| Error::Invalid("missing kind".into()))?;
    let kind = Kind::from_str(kind_s).map_err(|_| Error::Invalid(format!("unknown kind '{}'", kind_s)))?;
    if kind == Kind::Agent {
        return Err(Error::Invalid("agents cannot be applied".into()));
    }
    if json.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).is_none() {
        return Err(Error::Invalid("missing metadata.name".into()));
    }
    let obj = json.as_object_mut().ok_or_else(|| Error::Invalid("document is not a mapping".into()))?;
    obj.insert("kind".into(), Json::String(kind.as_str().to_string()));
    obj.entry("apiVersion").or_insert_with(|| Json::String(API_VERSION.to_string()));
    serde_json::from_value::<Resource>(json).map_err(|e| Error::Invalid(format!("{} spec: {}", kind, e)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

/// What `apply` would do with one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Planned {
    Create,
    Update { summary: DiffSummary },
    Unchanged,
    Invalid { reason: String },
}

/// Validate and diff against the store without writing anything.
pub fn plan(store: &ResourceStore, resources: &[Resource]) -> Result<Vec<(Resource, Planned)>> {
    let mut out = Vec::with_capacity(resources.len());
    for r in resources {
        if let Err(reason) = r.validate() {
            out.push((r.clone(), Planned::Invalid { reason }));
            continue;
        }
        let planned = match store.get(r.kind(), r.name())? {
            None => Planned::Create,
            Some(cur) => {
                let summary = diff_summary(&r.fingerprint()?, &cur.fingerprint()?);
                if summary == DiffSummary::default() { Planned::Unchanged } else { Planned::Update { summary } }
            }
        };
        out.push((r.clone(), planned));
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub files: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Apply the bundled type definitions under `dir`. Bad files are logged and skipped.
pub async fn seed(store: &ResourceStore, dir: &Path) -> anyhow::Result<SeedReport> {
    let started = Instant::now();
    let mut report = SeedReport::default();
    for folder in SEED_FOLDERS {
        let path = dir.join(folder);
        if !path.is_dir() {
            continue;
        }
        let mut files: Vec<_> = std::fs::read_dir(&path)
            .with_context(|| format!("reading seed folder {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|s| s.to_str()), Some("yaml") | Some("yml")))
            .collect();
        files.sort();
        for file in files {
            report.files += 1;
            let parsed = std::fs::read_to_string(&file)
                .map_err(|e| Error::Invalid(e.to_string()))
                .and_then(|text| parse_resources(&text));
            let resources = match parsed {
                Ok(r) => r,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "seed file skipped");
                    counter!("seed_errors_total", 1u64);
                    report.failed += 1;
                    continue;
                }
            };
            for status in store.apply(resources).await? {
                match status.status {
                    fleet_core::UpdateStatus::Invalid(reason) | fleet_core::UpdateStatus::Error(reason) => {
                        warn!(file = %file.display(), name = status.resource.name(), reason = %reason, "seed resource rejected");
                        report.failed += 1;
                    }
                    _ => report.applied += 1,
                }
            }
        }
    }
    histogram!("seed_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(files = report.files, applied = report.applied, failed = report.failed, "seeded resources");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_dispatch() {
        let yaml = r#"
apiVersion: bindplane.observiq.com/v1
kind: SourceType
metadata:
  name: macos
spec:
  parameters:
    - name: port
      type: int
---
kind: source
metadata:
  name: s1
spec:
  type: macos
---
"#;
        let rs = parse_resources(yaml).unwrap();
        assert_eq!(rs.len(), 2);
        assert_eq!(rs[0].kind(), Kind::SourceType);
        assert_eq!(rs[1].kind(), Kind::Source);
        assert_eq!(rs[1].name(), "s1");
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = parse_resources("metadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e1.contains("missing kind"), "e1={}", e1);

        let e2 = parse_resources("kind: Widget\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e2.contains("unknown kind 'Widget'"), "e2={}", e2);

        let e3 = parse_resources("kind: Source\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);

        let e4 = parse_resources("kind: Agent\nmetadata:\n  name: a\n").unwrap_err();
        assert!(matches!(e4, Error::Invalid(_)));

        let e5 = parse_resources("kind: SourceType\nmetadata:\n  name: ok\n---\nkind: Nope\nmetadata:\n  name: x\n")
            .unwrap_err()
            .to_string();
        assert!(e5.contains("document 2"), "e5={}", e5);
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }
}
