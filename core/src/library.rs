//! Typed access to stored entities.
//!
//! [`Library`] wraps a raw [`Store`] and owns every rule that spans more than
//! one document: name/alias uniqueness, references to other entities,
//! template links, collection parent cycles and delete cascades.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{Collection, Entity, EntityKind, Graph};
use crate::record::Attributes;
use crate::store::{ListQuery, Store, StoreError};

/// Upper bound on a collection's ancestry walk.
const MAX_DEPTH: usize = 256;

/// One node of the collection hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionTree {
    pub id: Uuid,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
    pub children: Vec<CollectionTree>,
}

#[derive(Clone)]
pub struct Library {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").finish_non_exhaustive()
    }
}

fn decode<E: Entity>(body: Value) -> Result<E, StoreError> {
    serde_json::from_value(body).map_err(|source| StoreError::Decode { kind: E::KIND, source })
}

fn encode<E: Entity>(entity: &E) -> Result<Value, StoreError> {
    serde_json::to_value(entity).map_err(|source| StoreError::Decode { kind: E::KIND, source })
}

fn field_id(doc: &Value, field: &str) -> Option<Uuid> {
    doc.get(field).and_then(Value::as_str).and_then(|s| s.parse().ok())
}

fn doc_id(doc: &Value) -> Option<Uuid> {
    field_id(doc, "id")
}

impl Library {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn get<E: Entity>(&self, id: Uuid) -> Result<E, StoreError> {
        match self.store.get(E::KIND, id).await? {
            Some(body) => decode(body),
            None => Err(StoreError::not_found(E::KIND, id)),
        }
    }

    /// Looks an entity up by id, then alias, then name.
    pub async fn get_by<E: Entity>(&self, key: &str) -> Result<E, StoreError> {
        if let Ok(id) = key.parse::<Uuid>() {
            if let Some(body) = self.store.get(E::KIND, id).await? {
                return decode(body);
            }
        }
        let mut all: Vec<E> = self.all().await?;
        let found = all
            .iter()
            .position(|e| e.alias() == Some(key))
            .or_else(|| all.iter().position(|e| e.item().name == key));
        match found {
            Some(i) => Ok(all.swap_remove(i)),
            None => Err(StoreError::not_found(E::KIND, key)),
        }
    }

    pub async fn all<E: Entity>(&self) -> Result<Vec<E>, StoreError> {
        self.store.list(E::KIND).await?.into_iter().map(decode).collect()
    }

    /// A filtered, sorted page and the number of matches before paging.
    pub async fn list<E: Entity>(&self, query: &ListQuery) -> Result<(Vec<E>, usize), StoreError> {
        let docs = self.store.list(E::KIND).await?;
        let (page, total) = query.apply(docs)?;
        let items = page.into_iter().map(decode).collect::<Result<_, _>>()?;
        Ok((items, total))
    }

    pub async fn count<E: Entity>(&self, query: &ListQuery) -> Result<usize, StoreError> {
        let docs = self.store.list(E::KIND).await?;
        Ok(query.apply(docs)?.1)
    }

    /// Validates and stores `entity`, assigning an id on first save.
    pub async fn save<E: Entity>(&self, mut entity: E) -> Result<E, StoreError> {
        entity.validate()?;

        let now = Utc::now();
        let existing = if entity.item().id.is_nil() {
            entity.item_mut().id = Uuid::new_v4();
            None
        } else {
            self.store.get(E::KIND, entity.item().id).await?
        };
        let created = existing
            .as_ref()
            .and_then(|doc| doc.get("created").cloned())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(now);
        let item = entity.item_mut();
        item.created = Some(created);
        item.modified = Some(now);

        self.check_unique(&entity).await?;
        self.check_references(&entity).await?;
        self.check_link(&entity).await?;
        if entity.parent().is_some() {
            self.check_ancestry(E::KIND, entity.item().id, entity.parent()).await?;
        }

        let id = entity.item().id;
        self.store.save(E::KIND, id, encode(&entity)?).await?;
        debug!(kind = %E::KIND, %id, name = %entity.item().name, "item saved");
        Ok(entity)
    }

    async fn check_unique<E: Entity>(&self, entity: &E) -> Result<(), StoreError> {
        let id = entity.item().id;
        for other in self.all::<E>().await? {
            if other.item().id == id {
                continue;
            }
            if other.item().name == entity.item().name {
                return Err(StoreError::Conflict {
                    kind: E::KIND,
                    field: "name",
                    value: entity.item().name.clone(),
                });
            }
            if let (Some(a), Some(b)) = (entity.alias(), other.alias()) {
                if a == b {
                    return Err(StoreError::Conflict { kind: E::KIND, field: "alias", value: a.to_string() });
                }
            }
        }
        Ok(())
    }

    async fn check_references<E: Entity>(&self, entity: &E) -> Result<(), StoreError> {
        let mut refs = entity.references();
        refs.extend(entity.parent().map(|id| crate::model::Reference { kind: E::KIND, id }));
        for r in refs {
            if self.store.get(r.kind, r.id).await?.is_none() {
                return Err(StoreError::MissingReference { kind: r.kind, id: r.id });
            }
        }
        Ok(())
    }

    /// A linked entity must point at a template of its own kind and carry
    /// every attribute the template's placeholders need.
    async fn check_link<E: Entity>(&self, entity: &E) -> Result<(), StoreError> {
        let Some(link) = entity.link() else {
            return Ok(());
        };
        let template: E = match self.store.get(E::KIND, link).await? {
            Some(body) => decode(body)?,
            None => return Err(StoreError::MissingReference { kind: E::KIND, id: link }),
        };
        if !template.is_template() {
            return Err(StoreError::NotTemplate { kind: E::KIND, id: link });
        }

        let empty = Attributes::new();
        let own = entity.attributes().unwrap_or(&empty);
        let inherited = template.attributes().unwrap_or(&empty);
        for key in template.template_keys()? {
            if !own.contains_key(&key) && !inherited.contains_key(&key) {
                return Err(crate::template::TemplateError::MissingAttribute(key).into());
            }
        }
        Ok(())
    }

    async fn check_ancestry(&self, kind: EntityKind, id: Uuid, parent: Option<Uuid>) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        let mut current = parent;
        while let Some(pid) = current {
            if pid == id || !seen.insert(pid) || seen.len() > MAX_DEPTH {
                return Err(StoreError::Cycle(pid));
            }
            current = match self.store.get(kind, pid).await? {
                Some(doc) => field_id(&doc, "parent"),
                None => None,
            };
        }
        Ok(())
    }

    /// Deletes the entity and cascades to what depends on it: linked
    /// instances of a template, collection entries pointing at a deleted
    /// graph, and parent links of child collections.
    pub async fn delete<E: Entity>(&self, id: Uuid) -> Result<(), StoreError> {
        if !self.store.delete(E::KIND, id).await? {
            return Err(StoreError::not_found(E::KIND, id));
        }
        debug!(kind = %E::KIND, %id, "item deleted");

        match E::KIND {
            EntityKind::Graph => {
                let mut removed = HashSet::from([id]);
                for doc in self.store.list(EntityKind::Graph).await? {
                    if let (Some(gid), Some(link)) = (doc_id(&doc), field_id(&doc, "link")) {
                        if link == id && self.store.delete(EntityKind::Graph, gid).await? {
                            removed.insert(gid);
                        }
                    }
                }
                self.detach_graphs(&removed).await?;
            }
            EntityKind::Collection => {
                let mut removed = HashSet::from([id]);
                for doc in self.store.list(EntityKind::Collection).await? {
                    if let (Some(cid), Some(link)) = (doc_id(&doc), field_id(&doc, "link")) {
                        if link == id && self.store.delete(EntityKind::Collection, cid).await? {
                            removed.insert(cid);
                        }
                    }
                }
                self.orphan_children(&removed).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn detach_graphs(&self, removed: &HashSet<Uuid>) -> Result<(), StoreError> {
        for mut collection in self.all::<Collection>().await? {
            let before = collection.entries.len();
            collection.entries.retain(|e| !removed.contains(&e.graph));
            if collection.entries.len() != before {
                let cid = collection.item.id;
                self.store.save(EntityKind::Collection, cid, encode(&collection)?).await?;
            }
        }
        Ok(())
    }

    async fn orphan_children(&self, removed: &HashSet<Uuid>) -> Result<(), StoreError> {
        for mut collection in self.all::<Collection>().await? {
            if collection.parent.is_some_and(|p| removed.contains(&p)) {
                collection.parent = None;
                let cid = collection.item.id;
                self.store.save(EntityKind::Collection, cid, encode(&collection)?).await?;
            }
        }
        Ok(())
    }

    /// Deletes every entity matched by `query`'s filters.
    pub async fn delete_matching<E: Entity>(&self, query: &ListQuery) -> Result<usize, StoreError> {
        let (matched, _) = self.list::<E>(&ListQuery { offset: 0, limit: None, ..query.clone() }).await?;
        let mut deleted = 0;
        for entity in matched {
            match self.delete::<E>(entity.item().id).await {
                Ok(()) => deleted += 1,
                // Already removed by an earlier cascade.
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// The graph behind `key` with its template applied and `attributes`
    /// expanded into it.
    pub async fn resolve_graph(&self, key: &str, attributes: &Attributes) -> Result<Graph, StoreError> {
        let graph: Graph = self.get_by(key).await?;
        self.expand_graph(&graph, attributes).await
    }

    /// Applies the graph's linked template, if any, and `attributes`.
    pub async fn expand_graph(&self, graph: &Graph, attributes: &Attributes) -> Result<Graph, StoreError> {
        let template = self.linked(graph).await?;
        Ok(graph.expand(template.as_ref(), attributes)?)
    }

    /// The collection behind `key`, expanded. Entries without a title of
    /// their own take the title of their graph expanded with the entry's
    /// attributes.
    pub async fn resolve_collection(&self, key: &str, attributes: &Attributes) -> Result<Collection, StoreError> {
        let collection: Collection = self.get_by(key).await?;
        let template = self.linked(&collection).await?;
        let mut expanded = collection.expand(template.as_ref(), attributes)?;

        for entry in &mut expanded.entries {
            if crate::model::option_title(&entry.options).is_some() {
                continue;
            }
            let mut attrs = expanded.attributes.clone();
            crate::model::merge_into(&mut attrs, &entry.attributes);
            match self.resolve_graph(&entry.graph.to_string(), &attrs).await {
                Ok(graph) => {
                    entry.options.insert("title".into(), Value::String(graph.title().to_string()));
                }
                Err(err) => warn!(graph = %entry.graph, error = %err, "unable to resolve collection entry"),
            }
        }
        Ok(expanded)
    }

    async fn linked<E: Entity>(&self, entity: &E) -> Result<Option<E>, StoreError> {
        match entity.link() {
            Some(link) => match self.store.get(E::KIND, link).await? {
                Some(body) => Ok(Some(decode(body)?)),
                None => Err(StoreError::MissingReference { kind: E::KIND, id: link }),
            },
            None => Ok(None),
        }
    }

    /// The non-template collection hierarchy under `root` (top level when
    /// `None`), children sorted by label.
    pub async fn collection_tree(&self, root: Option<Uuid>) -> Result<Vec<CollectionTree>, StoreError> {
        let all: Vec<Collection> = self.all().await?;
        let by_id: HashMap<Uuid, &Collection> = all.iter().map(|c| (c.item.id, c)).collect();

        let mut children: BTreeMap<Option<Uuid>, Vec<(Uuid, String)>> = BTreeMap::new();
        for c in all.iter().filter(|c| !c.template) {
            let template = c.link.and_then(|l| by_id.get(&l).copied());
            let label = match c.expand(template, &Attributes::new()) {
                Ok(expanded) => expanded.title().to_string(),
                Err(err) => {
                    warn!(id = %c.item.id, error = %err, "collection title does not expand");
                    c.item.name.clone()
                }
            };
            // Parents that vanished or are templates leave the child at the top.
            let parent = c.parent.filter(|p| by_id.get(p).is_some_and(|pc| !pc.template));
            children.entry(parent).or_default().push((c.item.id, label));
        }

        fn build(
            parent: Option<Uuid>,
            children: &BTreeMap<Option<Uuid>, Vec<(Uuid, String)>>,
            depth: usize,
        ) -> Vec<CollectionTree> {
            let Some(nodes) = children.get(&parent) else {
                return Vec::new();
            };
            let mut out: Vec<CollectionTree> = nodes
                .iter()
                .map(|(id, label)| CollectionTree {
                    id: *id,
                    label: label.clone(),
                    parent,
                    children: if depth < MAX_DEPTH { build(Some(*id), children, depth + 1) } else { Vec::new() },
                })
                .collect();
            out.sort_by(|a, b| a.label.cmp(&b.label));
            out
        }

        if let Some(id) = root {
            if !by_id.contains_key(&id) {
                return Err(StoreError::not_found(EntityKind::Collection, id));
            }
        }
        Ok(build(root, &children, 0))
    }
}
