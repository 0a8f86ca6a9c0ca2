//! Entity registry and lifecycle.
//!
//! The registry owns the arena of all entities ever defined in a model
//! instance and the canonical doubly-linked sequence of live entities.
//! Identity is monotonic and never reused; list order always reflects
//! creation order. Kill is a soft delete: the entity's list node is
//! unlinked but keeps its own `next`/`prev` pointers, so a cursor parked on
//! it can still advance, and `restore` relinks the same node at the
//! position implied by its identity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tephra_types::{EntityFlags, EntityId, FieldValue};

use crate::entity::Entity;
use crate::error::{StructuralError, ValidationFailure};
use crate::field::{Capability, FieldPhase, TypeKey, TypeRegistry};

/// Default bound on each prototype's reuse pool.
pub const DEFAULT_POOL_CAPACITY: usize = 100;

const HEAD: usize = 0;
const TAIL: usize = 1;

/// One list node. Nodes are allocated once per entity and never freed;
/// an unlinked node keeps its pointers into the live list.
#[derive(Debug, Clone, Copy)]
struct Node {
    next: usize,
    prev: usize,
    entity: Option<EntityId>,
}

/// Outcome of [`EntityRegistry::dispose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisposeOutcome {
    /// The entity was parked in its prototype's pool.
    Pooled,
    /// The pool was full (or the entity is not a clone); these entities
    /// were killed instead.
    Killed(Vec<EntityId>),
}

// ============================================================================
// Registry
// ============================================================================

/// Owner of all entities in one model instance.
pub struct EntityRegistry {
    types: Arc<TypeRegistry>,
    entities: BTreeMap<EntityId, Entity>,
    nodes: Vec<Node>,
    /// Name index: (registration scope, local name) → entity.
    names: HashMap<(Option<EntityId>, String), EntityId>,
    next_id: u64,
    live_count: usize,
    pool_capacity: usize,
    /// Bumped on every structural or field mutation; conditional waits
    /// re-evaluate when this moves.
    change_epoch: u64,
}

impl EntityRegistry {
    pub fn new(types: Arc<TypeRegistry>, pool_capacity: usize) -> Self {
        let nodes = vec![
            // Head sentinel: prev self-loops.
            Node {
                next: TAIL,
                prev: HEAD,
                entity: None,
            },
            // Tail sentinel: next self-loops.
            Node {
                next: TAIL,
                prev: HEAD,
                entity: None,
            },
        ];
        Self {
            types,
            entities: BTreeMap::new(),
            nodes,
            names: HashMap::new(),
            next_id: 1,
            live_count: 0,
            pool_capacity,
            change_epoch: 0,
        }
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    /// Number of live (non-dead, non-pooled) entities.
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Monotonic mutation counter.
    pub fn change_epoch(&self) -> u64 {
        self.change_epoch
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    fn entity(&self, id: EntityId) -> Result<&Entity, StructuralError> {
        self.entities
            .get(&id)
            .ok_or(StructuralError::MissingEntity(id))
    }

    /// Looks up an entity by local name within a registration scope.
    pub fn find(&self, scope: Option<EntityId>, name: &str) -> Option<EntityId> {
        self.names.get(&(scope, name.to_string())).copied()
    }

    pub fn is_dead(&self, id: EntityId) -> bool {
        self.entities.get(&id).is_none_or(Entity::is_dead)
    }

    // ------------------------------------------------------------------
    // Definition
    // ------------------------------------------------------------------

    /// Defines a new entity with a fresh identity at the tail of the live
    /// sequence. If `prototype` is given its concrete type must match, and
    /// the prototype's non-generated children are recursively instantiated
    /// with their inputs copied in two passes (early fields before all
    /// remaining fields).
    pub fn define(
        &mut self,
        type_name: &str,
        name: &str,
        prototype: Option<EntityId>,
        parent: Option<EntityId>,
        flags: EntityFlags,
    ) -> Result<EntityId, StructuralError> {
        let type_key = self
            .types
            .lookup(type_name)
            .ok_or_else(|| StructuralError::UnknownType(type_name.to_string()))?;
        let id = self.define_with_key(type_key, name, prototype, parent, flags)?;
        self.instantiate_prototype_children(id)?;
        Ok(id)
    }

    /// Single-level definition: allocates identity, node, name, and edges,
    /// without touching the prototype's children.
    fn define_with_key(
        &mut self,
        type_key: TypeKey,
        name: &str,
        prototype: Option<EntityId>,
        parent: Option<EntityId>,
        flags: EntityFlags,
    ) -> Result<EntityId, StructuralError> {
        let types = Arc::clone(&self.types);
        let info = types.get(type_key);

        if let Some(proto) = prototype {
            let proto_entity = self.entity(proto)?;
            if proto_entity.type_key() != type_key {
                return Err(StructuralError::PrototypeTypeMismatch {
                    entity_type: info.name().to_string(),
                    prototype_type: types.get(proto_entity.type_key()).name().to_string(),
                });
            }
        }
        if let Some(p) = parent {
            self.entity(p)?;
        }
        if flags.contains(EntityFlags::REGISTERED)
            && self.names.contains_key(&(parent, name.to_string()))
        {
            return Err(StructuralError::DuplicateName(name.to_string()));
        }

        let id = EntityId::new(self.next_id);
        self.next_id += 1;

        let node = self.nodes.len();
        let last = self.nodes[TAIL].prev;
        self.nodes.push(Node {
            next: TAIL,
            prev: last,
            entity: Some(id),
        });
        self.nodes[last].next = node;
        self.nodes[TAIL].prev = node;

        let entity = Entity::new(
            id,
            name.to_string(),
            type_key,
            flags,
            parent,
            prototype,
            info.fields().len(),
            info.new_state(),
            node,
        );
        self.entities.insert(id, entity);
        self.live_count += 1;

        if flags.contains(EntityFlags::REGISTERED) {
            self.names.insert((parent, name.to_string()), id);
        }
        if let Some(p) = parent {
            if let Some(pe) = self.entities.get_mut(&p) {
                pe.children_mut().push(id);
            }
        }
        if let Some(proto) = prototype {
            if let Some(pe) = self.entities.get_mut(&proto) {
                pe.clones_mut().push(id);
            }
        }

        self.change_epoch += 1;
        tracing::debug!(entity = %id, name, "defined entity");
        Ok(id)
    }

    /// Instantiates clone children for a freshly defined clone: one clone
    /// per non-generated child of the prototype, then copies each child's
    /// edited inputs in two passes (early fields first, since later fields
    /// may reference earlier ones by name).
    fn instantiate_prototype_children(&mut self, id: EntityId) -> Result<(), StructuralError> {
        let Some(entity) = self.entities.get(&id) else {
            return Ok(());
        };
        let Some(proto) = entity.prototype() else {
            return Ok(());
        };
        let inherit_generated = entity.flags().contains(EntityFlags::GENERATED);

        let proto_children: Vec<EntityId> = match self.entities.get(&proto) {
            Some(p) => p
                .children()
                .iter()
                .copied()
                .filter(|c| {
                    self.entities
                        .get(c)
                        .is_some_and(|e| e.is_live() && !e.flags().contains(EntityFlags::GENERATED))
                })
                .collect(),
            None => return Ok(()),
        };

        let mut pairs = Vec::with_capacity(proto_children.len());
        for src in proto_children {
            let (type_key, local_name, mut flags) = {
                let s = self.entity(src)?;
                (s.type_key(), s.name().to_string(), s.flags())
            };
            flags.remove(EntityFlags::DEAD);
            flags.remove(EntityFlags::POOLED);
            if inherit_generated {
                flags.insert(EntityFlags::GENERATED);
            }
            let child = self.define_with_key(type_key, &local_name, Some(src), Some(id), flags)?;
            self.instantiate_prototype_children(child)?;
            pairs.push((src, child));
        }

        for phase in [FieldPhase::Early, FieldPhase::Late] {
            for &(src, dst) in &pairs {
                self.copy_edited_fields(src, dst, phase)?;
            }
        }
        Ok(())
    }

    /// Copies fields of one phase that are edited on `src` onto `dst`.
    fn copy_edited_fields(
        &mut self,
        src: EntityId,
        dst: EntityId,
        phase: FieldPhase,
    ) -> Result<(), StructuralError> {
        let types = Arc::clone(&self.types);
        let (type_key, edited) = {
            let s = self.entity(src)?;
            (s.type_key(), s.edited_fields())
        };
        let info = types.get(type_key);
        for idx in edited {
            if info.fields()[idx].phase() != phase {
                continue;
            }
            let value = self.read_field_resolved(src, idx)?;
            self.set_field_by_index(dst, idx, &value)?;
        }
        Ok(())
    }

    /// Single-shot prototype assignment for an entity defined without one.
    pub fn set_prototype(
        &mut self,
        id: EntityId,
        prototype: EntityId,
    ) -> Result<(), StructuralError> {
        let types = Arc::clone(&self.types);
        let entity = self.entity(id)?;
        if entity.prototype().is_some() {
            return Err(StructuralError::PrototypeAlreadySet(id));
        }
        let entity_key = entity.type_key();
        let proto_entity = self.entity(prototype)?;
        if proto_entity.type_key() != entity_key {
            return Err(StructuralError::PrototypeTypeMismatch {
                entity_type: types.get(entity_key).name().to_string(),
                prototype_type: types.get(proto_entity.type_key()).name().to_string(),
            });
        }
        if let Some(e) = self.entities.get_mut(&id) {
            e.set_prototype_edge(prototype);
        }
        if let Some(p) = self.entities.get_mut(&prototype) {
            p.clones_mut().push(id);
        }
        self.change_epoch += 1;
        Ok(())
    }

    /// Renames a registered entity, re-keying the name index. Renaming is
    /// a registry operation, not a field mutation.
    pub fn rename(&mut self, id: EntityId, new_name: &str) -> Result<(), StructuralError> {
        let (scope, old_name, registered) = {
            let e = self.entity(id)?;
            (
                e.parent(),
                e.name().to_string(),
                e.flags().contains(EntityFlags::REGISTERED),
            )
        };
        if registered {
            let new_key = (scope, new_name.to_string());
            if let Some(&other) = self.names.get(&new_key) {
                if other != id {
                    return Err(StructuralError::DuplicateName(new_name.to_string()));
                }
            }
            self.names.remove(&(scope, old_name));
            self.names.insert(new_key, id);
        }
        if let Some(e) = self.entities.get_mut(&id) {
            e.set_name(new_name.to_string());
        }
        self.change_epoch += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Kill / Restore
    // ------------------------------------------------------------------

    /// Soft-deletes an entity: unlinks it from the live sequence, drops it
    /// from the name index, and recursively kills its children and
    /// registered clones. Idempotent; the arena slot survives for
    /// `restore`. Returns every entity newly marked dead.
    pub fn kill(&mut self, id: EntityId) -> Vec<EntityId> {
        let mut killed = Vec::new();
        self.kill_inner(id, &mut killed);
        if !killed.is_empty() {
            self.change_epoch += 1;
        }
        killed
    }

    fn kill_inner(&mut self, id: EntityId, killed: &mut Vec<EntityId>) {
        let Some(entity) = self.entities.get(&id) else {
            return;
        };
        if entity.is_dead() {
            return;
        }
        let was_live = entity.is_live();
        let was_pooled = entity.is_pooled();
        let node = entity.node();
        let scope = entity.parent();
        let name = entity.name().to_string();
        let registered = entity.flags().contains(EntityFlags::REGISTERED);
        let prototype = entity.prototype();
        let children = entity.children().to_vec();
        let clones = entity.clones().to_vec();

        if was_live {
            self.unlink(node);
            self.live_count -= 1;
        }
        if was_pooled {
            // Pulled out of its prototype's pool; it is no longer reusable.
            if let Some(p) = prototype.and_then(|p| self.entities.get_mut(&p)) {
                p.pool_mut().retain(|&pid| pid != id);
            }
        }
        if registered {
            self.names.remove(&(scope, name));
        }
        if let Some(e) = self.entities.get_mut(&id) {
            e.flags_mut().insert(EntityFlags::DEAD);
            e.flags_mut().remove(EntityFlags::POOLED);
        }
        killed.push(id);
        tracing::debug!(entity = %id, "killed entity");

        for child in children {
            self.kill_inner(child, killed);
        }
        for clone in clones {
            let clone_registered = self
                .entities
                .get(&clone)
                .is_some_and(|e| e.flags().contains(EntityFlags::REGISTERED));
            if clone_registered {
                self.kill_inner(clone, killed);
            }
        }
    }

    /// Reverses a kill: relinks the entity at the position implied by its
    /// identity, restores its name-index entry and prototype back-edge,
    /// and recursively restores children and clones.
    pub fn restore(&mut self, id: EntityId) -> Result<(), StructuralError> {
        self.entity(id)?;
        self.restore_inner(id)?;
        self.change_epoch += 1;
        Ok(())
    }

    fn restore_inner(&mut self, id: EntityId) -> Result<(), StructuralError> {
        let entity = self.entity(id)?;
        if !entity.is_dead() {
            return Ok(());
        }
        let node = entity.node();
        let scope = entity.parent();
        let name = entity.name().to_string();
        let registered = entity.flags().contains(EntityFlags::REGISTERED);
        let prototype = entity.prototype();
        let children = entity.children().to_vec();
        let clones = entity.clones().to_vec();

        if registered {
            let key = (scope, name.clone());
            if let Some(&other) = self.names.get(&key) {
                if other != id {
                    return Err(StructuralError::DuplicateName(name));
                }
            }
            self.names.insert(key, id);
        }

        self.link_by_identity(node, id);
        self.live_count += 1;
        if let Some(e) = self.entities.get_mut(&id) {
            e.flags_mut().remove(EntityFlags::DEAD);
        }
        if let Some(proto) = prototype {
            if let Some(p) = self.entities.get_mut(&proto) {
                if !p.clones().contains(&id) {
                    p.clones_mut().push(id);
                }
            }
        }
        tracing::debug!(entity = %id, "restored entity");

        for child in children {
            self.restore_inner(child)?;
        }
        for clone in clones {
            self.restore_inner(clone)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pooling
    // ------------------------------------------------------------------

    /// Retires a generated entity. A clone whose prototype has spare pool
    /// capacity is parked for reuse with its edited fields reset to
    /// defaults; otherwise it is killed.
    pub fn dispose(&mut self, id: EntityId) -> Result<DisposeOutcome, StructuralError> {
        let entity = self.entity(id)?;
        if !entity.flags().contains(EntityFlags::GENERATED) {
            return Err(StructuralError::DisposeNotGenerated(id));
        }
        if entity.is_dead() || entity.is_pooled() {
            return Ok(DisposeOutcome::Killed(Vec::new()));
        }
        let node = entity.node();
        let scope = entity.parent();
        let name = entity.name().to_string();
        let registered = entity.flags().contains(EntityFlags::REGISTERED);

        let proto_with_room = entity.prototype().filter(|p| {
            self.entities
                .get(p)
                .is_some_and(|pe| pe.pool().len() < self.pool_capacity)
        });
        let Some(proto) = proto_with_room else {
            return Ok(DisposeOutcome::Killed(self.kill(id)));
        };

        self.reset_edited_to_defaults(id)?;
        self.unlink(node);
        self.live_count -= 1;
        if registered {
            self.names.remove(&(scope, name));
        }
        if let Some(e) = self.entities.get_mut(&id) {
            e.flags_mut().insert(EntityFlags::POOLED);
        }
        if let Some(p) = self.entities.get_mut(&proto) {
            p.pool_mut().push(id);
        }
        self.change_epoch += 1;
        tracing::debug!(entity = %id, prototype = %proto, "pooled entity");
        Ok(DisposeOutcome::Pooled)
    }

    /// Pops the most recently pooled clone of `prototype` (LIFO), relinks
    /// it into the live sequence at its identity position, and returns it
    /// ready for reuse. Returns `None` if the pool is empty.
    pub fn acquire_from_pool(
        &mut self,
        prototype: EntityId,
    ) -> Result<Option<EntityId>, StructuralError> {
        let Some(id) = self
            .entities
            .get_mut(&prototype)
            .and_then(|p| p.pool_mut().pop())
        else {
            return Ok(None);
        };

        let (node, scope, name, registered) = {
            let e = self.entity(id)?;
            (
                e.node(),
                e.parent(),
                e.name().to_string(),
                e.flags().contains(EntityFlags::REGISTERED),
            )
        };
        if registered {
            let key = (scope, name.clone());
            if self.names.contains_key(&key) {
                // Put the clone back; the caller's name is in the way.
                if let Some(p) = self.entities.get_mut(&prototype) {
                    p.pool_mut().push(id);
                }
                return Err(StructuralError::DuplicateName(name));
            }
            self.names.insert(key, id);
        }
        // Edited fields were reset at dispose time; doing it again here
        // keeps the round trip idempotent.
        self.reset_edited_to_defaults(id)?;
        self.link_by_identity(node, id);
        self.live_count += 1;
        if let Some(e) = self.entities.get_mut(&id) {
            e.flags_mut().remove(EntityFlags::POOLED);
        }
        self.change_epoch += 1;
        Ok(Some(id))
    }

    /// Obtains a generated clone of `prototype`: a pooled clone when one is
    /// available, otherwise a freshly defined one with a derived name.
    pub fn spawn_clone(&mut self, prototype: EntityId) -> Result<EntityId, StructuralError> {
        if let Some(id) = self.acquire_from_pool(prototype)? {
            return Ok(id);
        }
        let (type_name, proto_name, parent) = {
            let types = Arc::clone(&self.types);
            let p = self.entity(prototype)?;
            (
                types.get(p.type_key()).name().to_string(),
                p.name().to_string(),
                p.parent(),
            )
        };
        let n = match self.entities.get_mut(&prototype) {
            Some(p) => p.next_spawn_number(),
            None => 0,
        };
        let name = format!("{proto_name}.{n}");
        self.define(
            &type_name,
            &name,
            Some(prototype),
            parent,
            EntityFlags::GENERATED,
        )
    }

    /// Drops every pooled clone (marks the husks dead). Run as part of
    /// per-run derived-state reset.
    pub fn clear_pools(&mut self) {
        let with_pools: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, e)| !e.pool().is_empty())
            .map(|(&id, _)| id)
            .collect();
        for id in with_pools {
            let pooled = match self.entities.get_mut(&id) {
                Some(e) => std::mem::take(e.pool_mut()),
                None => continue,
            };
            for pid in pooled {
                if let Some(e) = self.entities.get_mut(&pid) {
                    e.flags_mut().remove(EntityFlags::POOLED);
                    e.flags_mut().insert(EntityFlags::DEAD);
                }
            }
        }
        self.change_epoch += 1;
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    /// Reads a field by name, resolving unedited fields recursively
    /// through the prototype chain.
    pub fn get_field(&self, id: EntityId, field: &str) -> Result<FieldValue, StructuralError> {
        let entity = self.entity(id)?;
        let info = self.types.get(entity.type_key());
        let idx = info
            .field_index(field)
            .ok_or_else(|| StructuralError::UnknownField {
                type_name: info.name().to_string(),
                field: field.to_string(),
            })?;
        self.read_field_resolved(id, idx)
    }

    fn read_field_resolved(&self, id: EntityId, idx: usize) -> Result<FieldValue, StructuralError> {
        let entity = self.entity(id)?;
        if !entity.is_edited(idx) {
            if let Some(proto) = entity.prototype() {
                return self.read_field_resolved(proto, idx);
            }
        }
        let info = self.types.get(entity.type_key());
        Ok(info.fields()[idx].read(entity.state()))
    }

    /// Applies a "set field F of E to V" request: writes through the typed
    /// setter, marks the field edited, and fires the registered change
    /// callback, if any.
    pub fn set_field(
        &mut self,
        id: EntityId,
        field: &str,
        value: &FieldValue,
    ) -> Result<(), StructuralError> {
        let entity = self.entity(id)?;
        let info = self.types.get(entity.type_key());
        let idx = info
            .field_index(field)
            .ok_or_else(|| StructuralError::UnknownField {
                type_name: info.name().to_string(),
                field: field.to_string(),
            })?;
        self.set_field_by_index(id, idx, value)
    }

    fn set_field_by_index(
        &mut self,
        id: EntityId,
        idx: usize,
        value: &FieldValue,
    ) -> Result<(), StructuralError> {
        let types = Arc::clone(&self.types);
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(StructuralError::MissingEntity(id))?;
        let info = types.get(entity.type_key());
        info.fields()[idx].write(entity.state_mut(), value)?;
        entity.mark_edited(idx);
        self.change_epoch += 1;
        Ok(())
    }

    /// Restores every edited field of `id` to its declared default and
    /// clears the edited bitmap. Idempotent.
    pub fn reset_edited_to_defaults(&mut self, id: EntityId) -> Result<(), StructuralError> {
        let types = Arc::clone(&self.types);
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(StructuralError::MissingEntity(id))?;
        let info = types.get(entity.type_key());
        for idx in entity.edited_fields() {
            let default = info.fields()[idx].default_value().clone();
            info.fields()[idx].write(entity.state_mut(), &default)?;
        }
        entity.clear_edited();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// Forward cursor over the live sequence, starting before the first
    /// entity.
    pub fn walk(&self) -> Cursor {
        Cursor {
            node: HEAD,
            reverse: false,
            type_filter: None,
            capability_filter: None,
        }
    }

    /// Backward cursor, starting after the last entity.
    pub fn walk_back(&self) -> Cursor {
        Cursor {
            node: TAIL,
            reverse: true,
            type_filter: None,
            capability_filter: None,
        }
    }

    /// Ids of all currently live entities, in list order.
    pub fn live_ids(&self) -> Vec<EntityId> {
        let mut ids = Vec::with_capacity(self.live_count);
        let mut cursor = self.walk();
        while let Some(id) = cursor.next(self) {
            ids.push(id);
        }
        ids
    }

    // ------------------------------------------------------------------
    // Dependencies & Validation
    // ------------------------------------------------------------------

    /// Number of entities that must exist before `id` can be defined: its
    /// parent, its prototype, and the prototype's non-generated children.
    /// Used to topologically order bulk definition.
    pub fn dependency_count(&self, id: EntityId) -> Result<usize, StructuralError> {
        let entity = self.entity(id)?;
        let mut count = 0;
        if entity.parent().is_some() {
            count += 1;
        }
        if let Some(proto) = entity.prototype() {
            count += 1;
            if let Some(p) = self.entities.get(&proto) {
                count += p
                    .children()
                    .iter()
                    .filter(|c| {
                        self.entities.get(c).is_some_and(|e| {
                            e.is_live() && !e.flags().contains(EntityFlags::GENERATED)
                        })
                    })
                    .count();
            }
        }
        Ok(count)
    }

    /// Post-load consistency checks over every non-dead entity. Failures
    /// are aggregated; the controller refuses to start while any exist.
    pub fn validate(&self) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();
        for (&id, entity) in &self.entities {
            if entity.is_dead() {
                continue;
            }
            let fail = |message: String| ValidationFailure {
                entity: id,
                name: entity.name().to_string(),
                message,
            };
            if let Some(proto) = entity.prototype() {
                match self.entities.get(&proto) {
                    Some(p) if p.type_key() != entity.type_key() => {
                        failures.push(fail(format!(
                            "prototype {proto} has a different concrete type"
                        )));
                    }
                    Some(_) => {}
                    None => failures.push(fail(format!("prototype {proto} is not defined"))),
                }
            }
            if let Some(parent) = entity.parent() {
                if self.entities.get(&parent).is_none_or(Entity::is_dead) {
                    failures.push(fail(format!("parent {parent} is dead or missing")));
                }
            }
            if entity.is_live() && entity.flags().contains(EntityFlags::REGISTERED) {
                let key = (entity.parent(), entity.name().to_string());
                if self.names.get(&key) != Some(&id) {
                    failures.push(fail("name index entry is missing or stale".to_string()));
                }
            }
            for &pid in entity.pool() {
                if !self.entities.get(&pid).is_some_and(Entity::is_pooled) {
                    failures.push(fail(format!("pool entry {pid} is not a pooled entity")));
                }
            }
        }
        failures
    }

    // ------------------------------------------------------------------
    // List plumbing
    // ------------------------------------------------------------------

    /// Unlinks a node from the live sequence. The node's own pointers are
    /// left untouched so a cursor parked on it can still advance.
    fn unlink(&mut self, node: usize) {
        let Node { next, prev, .. } = self.nodes[node];
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    /// Relinks a node at the position implied by its entity's identity:
    /// immediately before the first live entity with a greater id.
    fn link_by_identity(&mut self, node: usize, id: EntityId) {
        let mut after = self.nodes[HEAD].next;
        while after != TAIL {
            let next_id = self.nodes[after].entity;
            if next_id.is_some_and(|nid| nid > id) {
                break;
            }
            after = self.nodes[after].next;
        }
        let prev = self.nodes[after].prev;
        self.nodes[node].next = after;
        self.nodes[node].prev = prev;
        self.nodes[prev].next = node;
        self.nodes[after].prev = node;
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.entities.len())
            .field("live", &self.live_count)
            .field("epoch", &self.change_epoch)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// A traversal position over the live sequence. Cursors hold a node index,
/// not a borrow, so the very entities being visited may kill themselves or
/// define siblings mid-iteration; dead nodes are skipped and traversal
/// stops only at the sentinel.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    node: usize,
    reverse: bool,
    type_filter: Option<TypeKey>,
    capability_filter: Option<Capability>,
}

impl Cursor {
    /// Restricts the cursor to entities of one concrete type.
    pub fn of_type(mut self, key: TypeKey) -> Self {
        self.type_filter = Some(key);
        self
    }

    /// Restricts the cursor to types advertising a capability.
    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capability_filter = Some(cap);
        self
    }

    /// Advances to the next live entity passing the filters, or `None` at
    /// the sentinel.
    pub fn next(&mut self, registry: &EntityRegistry) -> Option<EntityId> {
        loop {
            let step = if self.reverse {
                registry.nodes[self.node].prev
            } else {
                registry.nodes[self.node].next
            };
            if step == self.node {
                // Sentinel self-loop.
                return None;
            }
            self.node = step;
            if (!self.reverse && step == TAIL) || (self.reverse && step == HEAD) {
                return None;
            }
            let Some(id) = registry.nodes[step].entity else {
                continue;
            };
            let Some(entity) = registry.entities.get(&id) else {
                continue;
            };
            if !entity.is_live() {
                continue;
            }
            if self.type_filter.is_some_and(|tk| entity.type_key() != tk) {
                continue;
            }
            if let Some(cap) = self.capability_filter {
                let caps = registry.types.get(entity.type_key()).capabilities();
                if !caps.contains(cap) {
                    continue;
                }
            }
            return Some(id);
        }
    }
}
