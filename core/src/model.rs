//! Persisted library entities: providers, graphs, collections and
//! source/metric groups.
//!
//! Entities validate themselves (`Entity::validate`); referential checks
//! that need the store live in [`crate::library`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::connector::Settings;
use crate::error::ErrorKind;
use crate::filter::{FilterChain, FilterError, FilterRule};
use crate::pattern::{Pattern, PatternError};
use crate::record::Attributes;
use crate::series::{Consolidation, Operator};
use crate::template::{self, Template, TemplateError};

/// Free-form display options.
pub type Options = serde_json::Map<String, Value>;

/// Prefix marking a source or metric as a group reference.
pub const GROUP_PREFIX: &str = "group:";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("invalid alias {0:?}")]
    InvalidAlias(String),
    #[error("invalid refresh interval {0}")]
    InvalidInterval(i64),
    #[error("invalid priority {0}")]
    InvalidPriority(i64),
    #[error("missing connector type")]
    MissingConnector,
    #[error("a template cannot be linked to another item")]
    LinkedTemplate,
    #[error("an item cannot be its own parent")]
    SelfParent,
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::InvalidName(_)
            | ValidationError::InvalidAlias(_)
            | ValidationError::InvalidInterval(_)
            | ValidationError::InvalidPriority(_) => ErrorKind::Identity,
            ValidationError::MissingConnector
            | ValidationError::Filter(_)
            | ValidationError::Pattern(_) => ErrorKind::Configuration,
            ValidationError::LinkedTemplate | ValidationError::SelfParent => ErrorKind::Referential,
            ValidationError::Template(_) => ErrorKind::Template,
        }
    }
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9\-_.]*[A-Za-z0-9])?$").expect("name regex is valid")
    })
}

pub fn is_valid_name(name: &str) -> bool {
    name_re().is_match(name)
}

// ------------------------------------------------------------------ //
//  Kinds                                                              //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Provider,
    Graph,
    Collection,
    SourceGroup,
    MetricGroup,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Provider,
        EntityKind::Graph,
        EntityKind::Collection,
        EntityKind::SourceGroup,
        EntityKind::MetricGroup,
    ];

    /// Plural path segment / table discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Provider => "providers",
            EntityKind::Graph => "graphs",
            EntityKind::Collection => "collections",
            EntityKind::SourceGroup => "sourcegroups",
            EntityKind::MetricGroup => "metricgroups",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown item type {s:?}"))
    }
}

/// An entity the store must be able to resolve before saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub kind: EntityKind,
    pub id: Uuid,
}

// ------------------------------------------------------------------ //
//  Item / Entity                                                      //
// ------------------------------------------------------------------ //

/// Fields shared by every entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if is_valid_name(&self.name) {
            Ok(())
        } else {
            Err(ValidationError::InvalidName(self.name.clone()))
        }
    }
}

pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn item(&self) -> &Item;
    fn item_mut(&mut self) -> &mut Item;

    fn alias(&self) -> Option<&str> {
        None
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.item().validate()
    }

    /// Entities other than the link and the parent that must exist.
    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }

    fn parent(&self) -> Option<Uuid> {
        None
    }

    /// Template of the same kind this entity instantiates.
    fn link(&self) -> Option<Uuid> {
        None
    }

    fn is_template(&self) -> bool {
        false
    }

    fn attributes(&self) -> Option<&Attributes> {
        None
    }

    fn template_keys(&self) -> Result<BTreeSet<String>, TemplateError> {
        Ok(BTreeSet::new())
    }
}

fn validate_alias(alias: Option<&str>) -> Result<(), ValidationError> {
    match alias {
        Some(a) if !is_valid_name(a) => Err(ValidationError::InvalidAlias(a.to_string())),
        _ => Ok(()),
    }
}

fn non_empty(alias: &Option<String>) -> Option<&str> {
    alias.as_deref().filter(|a| !a.is_empty())
}

/// Merges `overlay` into `base`, overlay keys winning.
pub fn merge_into(base: &mut serde_json::Map<String, Value>, overlay: &serde_json::Map<String, Value>) {
    for (k, v) in overlay {
        base.insert(k.clone(), v.clone());
    }
}

fn option_f64(options: &Options, key: &str) -> Option<f64> {
    options.get(key).and_then(Value::as_f64)
}

fn option_bool(options: &Options, key: &str) -> Option<bool> {
    options.get(key).and_then(Value::as_bool)
}

pub fn option_title(options: &Options) -> Option<&str> {
    options.get("title").and_then(Value::as_str)
}

fn expand_title(options: &mut Options, attributes: &Attributes) -> Result<(), TemplateError> {
    if let Some(title) = option_title(options) {
        let expanded = template::expand(title, attributes)?;
        options.insert("title".into(), Value::String(expanded));
    }
    Ok(())
}

// ------------------------------------------------------------------ //
//  Provider                                                           //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConnector {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub settings: Settings,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(flatten)]
    pub item: Item,
    pub connector: ProviderConnector,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    /// Seconds between automatic refreshes; 0 disables them.
    #[serde(default)]
    pub refresh_interval: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Provider {
    pub fn new(name: &str, connector_type: &str, settings: Settings) -> Self {
        Self {
            item: Item::new(name),
            connector: ProviderConnector { kind: connector_type.to_string(), settings },
            filters: Vec::new(),
            refresh_interval: 0,
            priority: 0,
            enabled: true,
        }
    }
}

impl Entity for Provider {
    const KIND: EntityKind = EntityKind::Provider;

    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.item.validate()?;
        if self.connector.kind.is_empty() {
            return Err(ValidationError::MissingConnector);
        }
        if self.refresh_interval < 0 {
            return Err(ValidationError::InvalidInterval(self.refresh_interval));
        }
        if self.priority < 0 {
            return Err(ValidationError::InvalidPriority(self.priority));
        }
        FilterChain::new(&self.filters)?;
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  Graph                                                              //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesDef {
    #[serde(default)]
    pub name: String,
    pub origin: String,
    pub source: String,
    pub metric: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: Options,
}

impl SeriesDef {
    pub fn new(name: &str, origin: &str, source: &str, metric: &str) -> Self {
        Self {
            name: name.to_string(),
            origin: origin.to_string(),
            source: source.to_string(),
            metric: metric.to_string(),
            options: Options::new(),
        }
    }

    pub fn scale(&self) -> Option<f64> {
        option_f64(&self.options, "scale")
    }

    pub fn source_group(&self) -> Option<&str> {
        self.source.strip_prefix(GROUP_PREFIX)
    }

    pub fn metric_group(&self) -> Option<&str> {
        self.metric.strip_prefix(GROUP_PREFIX)
    }

    fn template_strings(&self) -> [&str; 4] {
        [&self.name, &self.origin, &self.source, &self.metric]
    }

    fn expand(&mut self, attributes: &Attributes) -> Result<(), TemplateError> {
        self.name = template::expand(&self.name, attributes)?;
        self.origin = template::expand(&self.origin, attributes)?;
        self.source = template::expand(&self.source, attributes)?;
        self.metric = template::expand(&self.metric, attributes)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub consolidate: Consolidation,
    #[serde(default)]
    pub series: Vec<SeriesDef>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: Options,
}

impl SeriesGroup {
    pub fn new(name: &str, operator: Operator, series: Vec<SeriesDef>) -> Self {
        Self { name: name.to_string(), operator, series, ..Default::default() }
    }

    pub fn interpolate(&self) -> bool {
        option_bool(&self.options, "interpolate").unwrap_or(true)
    }

    pub fn zero_nulls(&self) -> bool {
        option_bool(&self.options, "zero_nulls").unwrap_or(false)
    }

    pub fn scale(&self) -> Option<f64> {
        option_f64(&self.options, "scale")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(flatten)]
    pub item: Item,
    #[serde(default)]
    pub groups: Vec<SeriesGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Uuid>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: Options,
    #[serde(default)]
    pub template: bool,
}

impl Graph {
    pub fn new(name: &str, groups: Vec<SeriesGroup>) -> Self {
        Self { item: Item::new(name), groups, ..Default::default() }
    }

    pub fn title(&self) -> &str {
        option_title(&self.options).unwrap_or(&self.item.name)
    }

    pub fn percentiles(&self) -> Vec<f64> {
        self.options
            .get("percentiles")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default()
    }

    /// Placeholder keys used by the title and series definitions.
    pub fn template_keys(&self) -> Result<BTreeSet<String>, TemplateError> {
        let mut keys = BTreeSet::new();
        let title = option_title(&self.options).into_iter();
        let series = self.groups.iter().flat_map(|g| g.series.iter()).flat_map(|s| s.template_strings());
        for text in title.chain(series) {
            keys.extend(Template::parse(text)?.keys().into_iter().map(str::to_string));
        }
        Ok(keys)
    }

    /// Returns the concrete graph: the linked template (when `template` is
    /// given and this graph links to it) cloned under this graph's identity,
    /// with attributes merged as request > instance > template and every
    /// placeholder expanded. Neither input is modified.
    pub fn expand(&self, template: Option<&Graph>, attributes: &Attributes) -> Result<Graph, TemplateError> {
        let mut graph = match (self.link, template) {
            (Some(_), Some(tmpl)) => {
                let mut g = tmpl.clone();
                g.item = self.item.clone();
                g.link = self.link;
                g.alias = self.alias.clone();
                g.template = false;
                merge_into(&mut g.attributes, &self.attributes);
                merge_into(&mut g.options, &self.options);
                g
            }
            _ => self.clone(),
        };
        merge_into(&mut graph.attributes, attributes);

        expand_title(&mut graph.options, &graph.attributes)?;
        for group in &mut graph.groups {
            for series in &mut group.series {
                series.expand(&graph.attributes)?;
            }
        }
        Ok(graph)
    }
}

impl Entity for Graph {
    const KIND: EntityKind = EntityKind::Graph;

    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn alias(&self) -> Option<&str> {
        non_empty(&self.alias)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.item.validate()?;
        validate_alias(self.alias())?;
        if self.template && self.link.is_some() {
            return Err(ValidationError::LinkedTemplate);
        }
        self.template_keys()?;
        Ok(())
    }

    fn link(&self) -> Option<Uuid> {
        self.link
    }

    fn is_template(&self) -> bool {
        self.template
    }

    fn attributes(&self) -> Option<&Attributes> {
        Some(&self.attributes)
    }

    fn template_keys(&self) -> Result<BTreeSet<String>, TemplateError> {
        Graph::template_keys(self)
    }
}

// ------------------------------------------------------------------ //
//  Collection                                                         //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub graph: Uuid,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: Options,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(flatten)]
    pub item: Item,
    #[serde(default)]
    pub entries: Vec<CollectionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Uuid>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: Options,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
    #[serde(default)]
    pub template: bool,
}

impl Collection {
    pub fn new(name: &str) -> Self {
        Self { item: Item::new(name), ..Default::default() }
    }

    pub fn title(&self) -> &str {
        option_title(&self.options).unwrap_or(&self.item.name)
    }

    /// Like [`Graph::expand`]. Parent and identity stay this collection's.
    /// Entry attributes are merged over the collection's for each entry title.
    pub fn expand(
        &self,
        template: Option<&Collection>,
        attributes: &Attributes,
    ) -> Result<Collection, TemplateError> {
        let mut collection = match (self.link, template) {
            (Some(_), Some(tmpl)) => {
                let mut c = tmpl.clone();
                c.item = self.item.clone();
                c.link = self.link;
                c.alias = self.alias.clone();
                c.parent = self.parent;
                c.template = false;
                merge_into(&mut c.attributes, &self.attributes);
                merge_into(&mut c.options, &self.options);
                c
            }
            _ => self.clone(),
        };
        merge_into(&mut collection.attributes, attributes);

        expand_title(&mut collection.options, &collection.attributes)?;
        for entry in &mut collection.entries {
            let mut attrs = collection.attributes.clone();
            merge_into(&mut attrs, &entry.attributes);
            expand_title(&mut entry.options, &attrs)?;
        }
        Ok(collection)
    }

    pub fn template_keys(&self) -> Result<BTreeSet<String>, TemplateError> {
        let mut keys = BTreeSet::new();
        let titles = option_title(&self.options)
            .into_iter()
            .chain(self.entries.iter().filter_map(|e| option_title(&e.options)));
        for text in titles {
            keys.extend(Template::parse(text)?.keys().into_iter().map(str::to_string));
        }
        Ok(keys)
    }
}

impl Entity for Collection {
    const KIND: EntityKind = EntityKind::Collection;

    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn alias(&self) -> Option<&str> {
        non_empty(&self.alias)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.item.validate()?;
        validate_alias(self.alias())?;
        if self.template && self.link.is_some() {
            return Err(ValidationError::LinkedTemplate);
        }
        if !self.item.id.is_nil() && self.parent == Some(self.item.id) {
            return Err(ValidationError::SelfParent);
        }
        self.template_keys()?;
        Ok(())
    }

    fn references(&self) -> Vec<Reference> {
        self.entries
            .iter()
            .map(|e| Reference { kind: EntityKind::Graph, id: e.graph })
            .collect()
    }

    fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    fn link(&self) -> Option<Uuid> {
        self.link
    }

    fn is_template(&self) -> bool {
        self.template
    }

    fn attributes(&self) -> Option<&Attributes> {
        Some(&self.attributes)
    }

    fn template_keys(&self) -> Result<BTreeSet<String>, TemplateError> {
        Collection::template_keys(self)
    }
}

// ------------------------------------------------------------------ //
//  Source / metric groups                                             //
// ------------------------------------------------------------------ //

macro_rules! pattern_group {
    ($(#[$meta:meta])* $ty:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $ty {
            #[serde(flatten)]
            pub item: Item,
            #[serde(default)]
            pub patterns: Vec<String>,
        }

        impl $ty {
            pub fn new(name: &str, patterns: &[&str]) -> Self {
                Self {
                    item: Item::new(name),
                    patterns: patterns.iter().map(|p| p.to_string()).collect(),
                }
            }

            /// Compiles every pattern (literal, `glob:` or `regexp:`).
            pub fn compile(&self) -> Result<Vec<Pattern>, PatternError> {
                self.patterns.iter().map(|p| Pattern::parse(p)).collect()
            }
        }

        impl Entity for $ty {
            const KIND: EntityKind = $kind;

            fn item(&self) -> &Item {
                &self.item
            }

            fn item_mut(&mut self) -> &mut Item {
                &mut self.item
            }

            fn validate(&self) -> Result<(), ValidationError> {
                self.item.validate()?;
                self.compile()?;
                Ok(())
            }
        }
    };
}

pattern_group!(
    /// Named set of source patterns, referenced as `group:<id>`.
    SourceGroup,
    EntityKind::SourceGroup
);
pattern_group!(
    /// Named set of metric patterns, referenced as `group:<id>`.
    MetricGroup,
    EntityKind::MetricGroup
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(v: Value) -> Attributes {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn names() {
        for ok in ["a", "web01", "a.b-c_d", "A9"] {
            assert!(is_valid_name(ok), "{ok}");
        }
        for bad in ["", "-a", "a-", "a b", "a/b", ".a"] {
            assert!(!is_valid_name(bad), "{bad}");
        }
    }

    #[test]
    fn provider_validation() {
        let mut p = Provider::new("prov", "graphite", Settings::new());
        assert!(p.validate().is_ok());

        p.refresh_interval = -1;
        assert_eq!(p.validate().unwrap_err().kind(), ErrorKind::Identity);
        p.refresh_interval = 0;

        p.priority = -5;
        assert!(matches!(p.validate(), Err(ValidationError::InvalidPriority(-5))));
        p.priority = 0;

        p.filters = vec![FilterRule::new(
            crate::filter::FilterAction::Discard,
            crate::filter::FilterTarget::Metric,
            "(",
            "",
        )];
        assert_eq!(p.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn provider_decodes_with_defaults() {
        let p: Provider = serde_json::from_value(json!({
            "name": "prov",
            "connector": {"type": "graphite", "settings": {"url": "http://g"}},
        }))
        .unwrap();
        assert!(p.enabled);
        assert!(p.item.id.is_nil());
        assert_eq!(p.connector.settings.required_string("url").unwrap(), "http://g");
    }

    #[test]
    fn graph_alias_and_link_rules() {
        let mut g = Graph::new("g", vec![]);
        g.alias = Some("bad alias".into());
        assert!(matches!(g.validate(), Err(ValidationError::InvalidAlias(_))));

        g.alias = Some(String::new());
        assert!(g.validate().is_ok());

        g.template = true;
        g.link = Some(Uuid::new_v4());
        assert_eq!(g.validate().unwrap_err().kind(), ErrorKind::Referential);
    }

    #[test]
    fn graph_with_bad_placeholder_is_template_error() {
        let mut g = Graph::new("g", vec![]);
        g.options.insert("title".into(), json!("{{ .host"));
        assert_eq!(g.validate().unwrap_err().kind(), ErrorKind::Template);
    }

    #[test]
    fn linked_graph_expansion() {
        let mut tmpl = Graph::new(
            "tmpl",
            vec![SeriesGroup::new(
                "load",
                Operator::None,
                vec![SeriesDef::new("{{ .host }}", "collectd", "{{ .host }}", "load.{{ .kind }}")],
            )],
        );
        tmpl.template = true;
        tmpl.item.id = Uuid::new_v4();
        tmpl.options.insert("title".into(), json!("{{ .host }} load"));
        tmpl.attributes = attrs(json!({"kind": "shortterm"}));

        let mut linked = Graph::new("web01-load", vec![]);
        linked.item.id = Uuid::new_v4();
        linked.link = Some(tmpl.item.id);
        linked.attributes = attrs(json!({"host": "web01"}));

        let out = linked.expand(Some(&tmpl), &Attributes::new()).unwrap();
        assert_eq!(out.item.id, linked.item.id);
        assert!(!out.template);
        assert_eq!(out.title(), "web01 load");
        let s = &out.groups[0].series[0];
        assert_eq!((s.name.as_str(), s.source.as_str(), s.metric.as_str()), ("web01", "web01", "load.shortterm"));

        // Request attributes win over instance attributes.
        let out = linked.expand(Some(&tmpl), &attrs(json!({"host": "db01"}))).unwrap();
        assert_eq!(out.title(), "db01 load");

        // The template itself is untouched.
        assert_eq!(option_title(&tmpl.options), Some("{{ .host }} load"));
        assert_eq!(Graph::template_keys(&tmpl).unwrap().into_iter().collect::<Vec<_>>(), vec!["host", "kind"]);
    }

    #[test]
    fn collection_expansion_merges_entry_attributes() {
        let mut c = Collection::new("c");
        c.options.insert("title".into(), json!("{{ .dc }} hosts"));
        c.attributes = attrs(json!({"dc": "par1", "host": "any"}));
        c.entries.push(CollectionEntry {
            graph: Uuid::new_v4(),
            attributes: attrs(json!({"host": "web01"})),
            options: attrs(json!({"title": "{{ .host }} in {{ .dc }}"})),
        });

        let out = c.expand(None, &Attributes::new()).unwrap();
        assert_eq!(out.title(), "par1 hosts");
        assert_eq!(option_title(&out.entries[0].options), Some("web01 in par1"));
    }

    #[test]
    fn collection_references() {
        let mut c = Collection::new("c");
        c.item.id = Uuid::new_v4();
        c.parent = Some(c.item.id);
        assert!(matches!(c.validate(), Err(ValidationError::SelfParent)));

        let parent = Uuid::new_v4();
        c.parent = Some(parent);
        c.entries.push(CollectionEntry { graph: Uuid::new_v4(), ..Default::default() });
        assert_eq!(c.references().len(), 1);
        assert_eq!(Entity::parent(&c), Some(parent));
    }

    #[test]
    fn group_patterns_must_compile() {
        assert!(SourceGroup::new("g", &["glob:web*", "db01"]).validate().is_ok());
        let err = MetricGroup::new("g", &["regexp:("]).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn group_references() {
        let s = SeriesDef::new("", "o", "group:abc", "cpu");
        assert_eq!(s.source_group(), Some("abc"));
        assert_eq!(s.metric_group(), None);
    }

    #[test]
    fn kinds_round_trip_path_segments() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("widgets".parse::<EntityKind>().is_err());
    }
}
