//! The entity record.
//!
//! Entities live in an arena owned by the registry and reference each other
//! by identity, never by owning pointers. Parent, prototype, clone-list and
//! child-list edges are ids checked lazily against liveness, so a kill
//! never walks the whole graph fixing references.

use tephra_types::{EntityFlags, EntityId};

use crate::field::TypeKey;
use crate::scheduler::EventHandle;

/// One unit of simulation state: identity, name, lifecycle flags,
/// relationship edges, the edited-field bitmap, and the boxed per-type
/// state.
pub struct Entity {
    id: EntityId,
    name: String,
    type_key: TypeKey,
    flags: EntityFlags,
    parent: Option<EntityId>,
    prototype: Option<EntityId>,
    /// Weak back-references from prototype to clones.
    clones: Vec<EntityId>,
    /// Weak references to contained children.
    children: Vec<EntityId>,
    /// Bounded LIFO stack of reusable generated clones of this entity.
    pool: Vec<EntityId>,
    /// Count of generated clones ever spawned from this prototype; used to
    /// derive unique clone names.
    spawn_count: u64,
    /// Which fields have been explicitly set (edited away from default).
    /// Unedited fields resolve through the prototype chain at read time.
    edited: Vec<bool>,
    state: Box<dyn crate::field::EntityState>,
    /// Registry list node index; fixed for the entity's whole life.
    node: usize,
    /// Pending process continuation, if the entity is blocked on a delay.
    process: Option<EventHandle>,
}

impl Entity {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: EntityId,
        name: String,
        type_key: TypeKey,
        flags: EntityFlags,
        parent: Option<EntityId>,
        prototype: Option<EntityId>,
        field_count: usize,
        state: Box<dyn crate::field::EntityState>,
        node: usize,
    ) -> Self {
        Self {
            id,
            name,
            type_key,
            flags,
            parent,
            prototype,
            clones: Vec::new(),
            children: Vec::new(),
            pool: Vec::new(),
            spawn_count: 0,
            edited: vec![false; field_count],
            state,
            node,
            process: None,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn flags(&self) -> EntityFlags {
        self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut EntityFlags {
        &mut self.flags
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(EntityFlags::DEAD)
    }

    pub fn is_pooled(&self) -> bool {
        self.flags.contains(EntityFlags::POOLED)
    }

    /// Live means present in the registry iteration sequence.
    pub fn is_live(&self) -> bool {
        !self.is_dead() && !self.is_pooled()
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub fn prototype(&self) -> Option<EntityId> {
        self.prototype
    }

    pub(crate) fn set_prototype_edge(&mut self, prototype: EntityId) {
        self.prototype = Some(prototype);
    }

    /// Clone back-references; may contain dead entries (validated lazily).
    pub fn clones(&self) -> &[EntityId] {
        &self.clones
    }

    pub(crate) fn clones_mut(&mut self) -> &mut Vec<EntityId> {
        &mut self.clones
    }

    /// Child references; may contain dead entries (validated lazily).
    pub fn children(&self) -> &[EntityId] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<EntityId> {
        &mut self.children
    }

    pub fn pool(&self) -> &[EntityId] {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut Vec<EntityId> {
        &mut self.pool
    }

    pub(crate) fn next_spawn_number(&mut self) -> u64 {
        self.spawn_count += 1;
        self.spawn_count
    }

    pub fn is_edited(&self, field: usize) -> bool {
        self.edited.get(field).copied().unwrap_or(false)
    }

    pub(crate) fn mark_edited(&mut self, field: usize) {
        if field < self.edited.len() {
            self.edited[field] = true;
        }
        self.flags.insert(EntityFlags::EDITED);
    }

    pub(crate) fn clear_edited(&mut self) {
        self.edited.fill(false);
        self.flags.remove(EntityFlags::EDITED);
    }

    /// Indices of fields currently edited away from their defaults.
    pub(crate) fn edited_fields(&self) -> Vec<usize> {
        self.edited
            .iter()
            .enumerate()
            .filter_map(|(i, &e)| e.then_some(i))
            .collect()
    }

    pub fn state(&self) -> &dyn crate::field::EntityState {
        &*self.state
    }

    pub fn state_mut(&mut self) -> &mut dyn crate::field::EntityState {
        &mut *self.state
    }

    pub(crate) fn node(&self) -> usize {
        self.node
    }

    /// Pending process continuation handle, if blocked on a delay.
    pub fn process(&self) -> Option<EventHandle> {
        self.process
    }

    pub(crate) fn set_process(&mut self, handle: Option<EventHandle>) {
        self.process = handle;
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("parent", &self.parent)
            .field("prototype", &self.prototype)
            .finish_non_exhaustive()
    }
}
