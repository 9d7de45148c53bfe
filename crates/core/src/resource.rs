//! Catalog resources.
//!
//! Every resource is an [`Object`] with a kind-specific spec. The [`Resource`] enum is the
//! tagged union dispatched on the declared `kind`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{Dependency, Error, Result};
use crate::labels::{Labels, Selector};

pub const API_VERSION: &str = "bindplane.observiq.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    SourceType,
    Source,
    ProcessorType,
    Processor,
    DestinationType,
    Destination,
    Configuration,
    Agent,
}

impl Kind {
    pub const ALL: [Kind; 8] = [
        Kind::SourceType,
        Kind::Source,
        Kind::ProcessorType,
        Kind::Processor,
        Kind::DestinationType,
        Kind::Destination,
        Kind::Configuration,
        Kind::Agent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::SourceType => "SourceType",
            Kind::Source => "Source",
            Kind::ProcessorType => "ProcessorType",
            Kind::Processor => "Processor",
            Kind::DestinationType => "DestinationType",
            Kind::Destination => "Destination",
            Kind::Configuration => "Configuration",
            Kind::Agent => "Agent",
        }
    }

    /// Order in which a bulk delete removes kinds so dependents go before what they use.
    pub fn delete_rank(&self) -> u8 {
        match self {
            Kind::Agent => 0,
            Kind::Configuration => 1,
            Kind::Source => 2,
            Kind::Destination => 3,
            Kind::Processor => 4,
            Kind::SourceType => 5,
            Kind::DestinationType => 6,
            Kind::ProcessorType => 7,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Kind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Invalid(format!("unknown kind '{}'", s)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
}

/// A catalog entry with a kind-specific spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object<S> {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub metadata: Metadata,
    pub spec: S,
}

fn default_api_version() -> String { API_VERSION.to_string() }

impl<S> Object<S> {
    pub fn new(name: impl Into<String>, spec: S) -> Self {
        Self {
            api_version: default_api_version(),
            metadata: Metadata { name: name.into(), ..Default::default() },
            spec,
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.metadata.labels = labels;
        self
    }

    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn id(&self) -> &str { &self.metadata.id }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: Json,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Json>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Strings,
    Int,
    Bool,
    Enum,
    Map,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_values: Vec<String>,
}

impl ParameterDefinition {
    /// Check a supplied value against the declared type.
    pub fn check(&self, value: &Json) -> std::result::Result<(), String> {
        let ok = match self.kind {
            ParameterType::String => value.is_string(),
            ParameterType::Strings => value.as_array().map(|a| a.iter().all(|v| v.is_string())).unwrap_or(false),
            ParameterType::Int => value.is_i64() || value.is_u64(),
            ParameterType::Bool => value.is_boolean(),
            ParameterType::Map => value.is_object(),
            ParameterType::Enum => value
                .as_str()
                .map(|s| self.valid_values.iter().any(|v| v == s))
                .unwrap_or(false),
        };
        if ok { Ok(()) } else { Err(format!("parameter '{}' has an invalid value for type {:?}", self.name, self.kind)) }
    }
}

/// Spec shared by SourceType, ProcessorType and DestinationType.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTypeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_platforms: Vec<String>,
    /// Opaque rendering data consumed by the external collector-config renderer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates: Option<Json>,
}

impl ResourceTypeSpec {
    /// Validate supplied parameters: required ones present, no unknown names, values typed.
    pub fn validate_parameters(&self, params: &[Parameter]) -> std::result::Result<(), String> {
        for p in params {
            match self.parameters.iter().find(|d| d.name == p.name) {
                Some(def) => def.check(&p.value)?,
                None => return Err(format!("unknown parameter '{}'", p.name)),
            }
        }
        for def in self.parameters.iter().filter(|d| d.required && d.default.is_none()) {
            if !params.iter().any(|p| p.name == def.name) {
                return Err(format!("missing required parameter '{}'", def.name));
            }
        }
        Ok(())
    }
}

/// Reference to a named resource or an inline instance of a type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processors: Vec<ResourceConfiguration>,
}

impl ResourceConfiguration {
    pub fn named(name: impl Into<String>) -> Self { Self { name: Some(name.into()), ..Default::default() } }
    pub fn typed(kind: impl Into<String>) -> Self { Self { kind: Some(kind.into()), ..Default::default() } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processors: Vec<ResourceConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSelector {
    #[serde(default)]
    pub match_labels: Labels,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Raw collector document used verbatim when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ResourceConfiguration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<ResourceConfiguration>,
    #[serde(default)]
    pub selector: AgentSelector,
}

pub type SourceType = Object<ResourceTypeSpec>;
pub type ProcessorType = Object<ResourceTypeSpec>;
pub type DestinationType = Object<ResourceTypeSpec>;
pub type Source = Object<SourceSpec>;
pub type Processor = Object<ProcessorSpec>;
pub type Destination = Object<DestinationSpec>;
pub type Configuration = Object<ConfigurationSpec>;

impl Source {
    /// Names of processors this source embeds by reference.
    pub fn processor_names(&self) -> impl Iterator<Item = &str> {
        self.spec.processors.iter().filter_map(|p| p.name.as_deref())
    }

    /// Types of processors this source embeds inline.
    pub fn processor_types(&self) -> impl Iterator<Item = &str> {
        self.spec.processors.iter().filter_map(|p| p.kind.as_deref())
    }
}

impl Configuration {
    pub fn source_names(&self) -> impl Iterator<Item = &str> { self.spec.sources.iter().filter_map(|s| s.name.as_deref()) }
    pub fn source_types(&self) -> impl Iterator<Item = &str> { self.spec.sources.iter().filter_map(|s| s.kind.as_deref()) }
    pub fn destination_names(&self) -> impl Iterator<Item = &str> { self.spec.destinations.iter().filter_map(|d| d.name.as_deref()) }
    pub fn destination_types(&self) -> impl Iterator<Item = &str> { self.spec.destinations.iter().filter_map(|d| d.kind.as_deref()) }

    pub fn processor_names(&self) -> impl Iterator<Item = &str> {
        self.spec.sources.iter().flat_map(|s| s.processors.iter()).filter_map(|p| p.name.as_deref())
    }

    pub fn processor_types(&self) -> impl Iterator<Item = &str> {
        self.spec.sources.iter().flat_map(|s| s.processors.iter()).filter_map(|p| p.kind.as_deref())
    }

    pub fn selector(&self) -> Selector { Selector::from_labels(&self.spec.selector.match_labels) }

    /// True if the selector is non-empty and satisfied by `labels`. An empty selector never
    /// matches; such a configuration is only reachable through the `configuration` label.
    pub fn matches(&self, labels: &Labels) -> bool {
        let sel = self.selector();
        !sel.is_everything() && sel.matches(labels)
    }
}

/// Tagged union over the applicable catalog kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Resource {
    SourceType(SourceType),
    Source(Source),
    ProcessorType(ProcessorType),
    Processor(Processor),
    DestinationType(DestinationType),
    Destination(Destination),
    Configuration(Configuration),
}

macro_rules! each_resource {
    ($self:expr, $r:ident => $body:expr) => {
        match $self {
            Resource::SourceType($r) => $body,
            Resource::Source($r) => $body,
            Resource::ProcessorType($r) => $body,
            Resource::Processor($r) => $body,
            Resource::DestinationType($r) => $body,
            Resource::Destination($r) => $body,
            Resource::Configuration($r) => $body,
        }
    };
}

impl Resource {
    pub fn kind(&self) -> Kind {
        match self {
            Resource::SourceType(_) => Kind::SourceType,
            Resource::Source(_) => Kind::Source,
            Resource::ProcessorType(_) => Kind::ProcessorType,
            Resource::Processor(_) => Kind::Processor,
            Resource::DestinationType(_) => Kind::DestinationType,
            Resource::Destination(_) => Kind::Destination,
            Resource::Configuration(_) => Kind::Configuration,
        }
    }

    pub fn metadata(&self) -> &Metadata { each_resource!(self, r => &r.metadata) }
    pub fn metadata_mut(&mut self) -> &mut Metadata { each_resource!(self, r => &mut r.metadata) }
    pub fn name(&self) -> &str { &self.metadata().name }
    pub fn id(&self) -> &str { &self.metadata().id }
    pub fn labels(&self) -> &Labels { &self.metadata().labels }

    pub fn reference(&self) -> Dependency { Dependency { kind: self.kind(), name: self.name().to_string() } }

    /// Serialized form without the server-assigned id, used to detect real changes.
    pub fn fingerprint(&self) -> Result<Json> {
        let mut v = serde_json::to_value(self)?;
        if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("id");
        }
        Ok(v)
    }

    /// True if both resources serialize identically once ids are ignored.
    pub fn same_as(&self, other: &Resource) -> Result<bool> { Ok(self.fingerprint()? == other.fingerprint()?) }

    /// Resources this one refers to and which must exist for it to be valid.
    pub fn dependencies(&self) -> Vec<Dependency> {
        fn dep(kind: Kind, name: &str) -> Dependency { Dependency { kind, name: name.to_string() } }
        let mut out = Vec::new();
        match self {
            Resource::SourceType(_) | Resource::ProcessorType(_) | Resource::DestinationType(_) => {}
            Resource::Source(s) => {
                out.push(dep(Kind::SourceType, &s.spec.kind));
                out.extend(s.processor_names().map(|n| dep(Kind::Processor, n)));
                out.extend(s.processor_types().map(|t| dep(Kind::ProcessorType, t)));
            }
            Resource::Processor(p) => out.push(dep(Kind::ProcessorType, &p.spec.kind)),
            Resource::Destination(d) => out.push(dep(Kind::DestinationType, &d.spec.kind)),
            Resource::Configuration(c) => {
                out.extend(c.source_names().map(|n| dep(Kind::Source, n)));
                out.extend(c.source_types().map(|t| dep(Kind::SourceType, t)));
                out.extend(c.processor_names().map(|n| dep(Kind::Processor, n)));
                out.extend(c.processor_types().map(|t| dep(Kind::ProcessorType, t)));
                out.extend(c.destination_names().map(|n| dep(Kind::Destination, n)));
                out.extend(c.destination_types().map(|t| dep(Kind::DestinationType, t)));
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Structural checks that need no other resource.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let meta = self.metadata();
        if meta.name.trim().is_empty() {
            return Err("metadata.name is required".to_string());
        }
        if meta.name.contains(char::is_whitespace) {
            return Err(format!("name '{}' must not contain whitespace", meta.name));
        }
        meta.labels.validate().map_err(|e| e.to_string())?;
        match self {
            Resource::Source(s) if s.spec.kind.is_empty() => Err("spec.type is required".to_string()),
            Resource::Processor(p) if p.spec.kind.is_empty() => Err("spec.type is required".to_string()),
            Resource::Destination(d) if d.spec.kind.is_empty() => Err("spec.type is required".to_string()),
            Resource::Source(s) => validate_refs(&s.spec.processors, "processor"),
            Resource::Configuration(c) => {
                c.spec.selector.match_labels.validate().map_err(|e| e.to_string())?;
                validate_refs(&c.spec.sources, "source")?;
                validate_refs(&c.spec.destinations, "destination")?;
                for s in c.spec.sources.iter() {
                    validate_refs(&s.processors, "processor")?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn validate_refs(refs: &[ResourceConfiguration], what: &str) -> std::result::Result<(), String> {
    for (i, r) in refs.iter().enumerate() {
        match (&r.name, &r.kind) {
            (Some(_), Some(_)) => return Err(format!("{} {} must set only one of name or type", what, i)),
            (None, None) => return Err(format!("{} {} must set name or type", what, i)),
            _ => {}
        }
    }
    Ok(())
}

macro_rules! into_resource {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Resource {
            fn from(v: $ty) -> Self { Resource::$variant(v) }
        }
    };
}

into_resource!(Source, Source);
into_resource!(Processor, Processor);
into_resource!(Destination, Destination);
into_resource!(Configuration, Configuration);

impl Resource {
    pub fn source_type(t: SourceType) -> Self { Resource::SourceType(t) }
    pub fn processor_type(t: ProcessorType) -> Self { Resource::ProcessorType(t) }
    pub fn destination_type(t: DestinationType) -> Self { Resource::DestinationType(t) }
}

/// Outcome of applying or deleting a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum UpdateStatus {
    Created,
    Configured,
    Unchanged,
    Deleted,
    InUse(String),
    Invalid(String),
    Error(String),
}

impl UpdateStatus {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateStatus::Created => "created",
            UpdateStatus::Configured => "configured",
            UpdateStatus::Unchanged => "unchanged",
            UpdateStatus::Deleted => "deleted",
            UpdateStatus::InUse(_) => "in-use",
            UpdateStatus::Invalid(_) => "invalid",
            UpdateStatus::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource: Resource,
    #[serde(flatten)]
    pub status: UpdateStatus,
}

impl ResourceStatus {
    pub fn new(resource: Resource, status: UpdateStatus) -> Self { Self { resource, status } }
}
