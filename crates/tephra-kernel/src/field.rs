//! Per-type field tables and the type registry.
//!
//! The configuration layer applies inputs as "set field F of entity E to
//! value V" requests by name. Instead of runtime type introspection, every
//! concrete entity type registers an explicit table of typed getter/setter
//! pairs at startup; field lookup is a name search in that table and field
//! application is a plain function call.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tephra_types::FieldValue;

use crate::error::StructuralError;
use crate::process::Behavior;

// ============================================================================
// Entity State
// ============================================================================

/// Concrete per-type simulation state held by an entity. Field accessors
/// registered in the type's [`TypeInfo`] downcast to the concrete type.
pub trait EntityState: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> EntityState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn EntityState {
    /// Borrows the state as its concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutably borrows the state as its concrete type.
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// A marker capability an entity type can advertise; used to filter
/// registry traversal without knowing concrete types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability(u64);

impl Capability {
    /// Capability occupying bit `bit` (0..64).
    pub const fn bit(bit: u8) -> Self {
        Self(1 << bit)
    }
}

/// Set of capabilities advertised by one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u64);

impl CapabilitySet {
    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.0 == cap.0
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.0;
    }
}

// ============================================================================
// Field Definitions
// ============================================================================

/// Application phase of a field. Early fields (identity and entity
/// references) are copied before all remaining fields when a clone's
/// children are instantiated, because later fields may refer to earlier
/// ones by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPhase {
    Early,
    Late,
}

/// Typed getter: reads the field out of the concrete state.
pub type FieldGet = fn(&dyn EntityState) -> FieldValue;

/// Typed setter: writes a value into the concrete state, rejecting values
/// of the wrong kind.
pub type FieldSet = fn(&mut dyn EntityState, &FieldValue) -> Result<(), StructuralError>;

/// Optional callback invoked on the entity state after a successful set.
pub type FieldChanged = fn(&mut dyn EntityState);

/// One named field of an entity type: its phase, declared default, and
/// accessor pair.
pub struct FieldDef {
    name: &'static str,
    phase: FieldPhase,
    default: FieldValue,
    get: FieldGet,
    set: FieldSet,
    changed: Option<FieldChanged>,
}

impl FieldDef {
    pub fn new(
        name: &'static str,
        phase: FieldPhase,
        default: FieldValue,
        get: FieldGet,
        set: FieldSet,
    ) -> Self {
        Self {
            name,
            phase,
            default,
            get,
            set,
            changed: None,
        }
    }

    /// An early-phase field (identity/reference inputs).
    pub fn early(name: &'static str, default: FieldValue, get: FieldGet, set: FieldSet) -> Self {
        Self::new(name, FieldPhase::Early, default, get, set)
    }

    /// A late-phase field (everything else).
    pub fn late(name: &'static str, default: FieldValue, get: FieldGet, set: FieldSet) -> Self {
        Self::new(name, FieldPhase::Late, default, get, set)
    }

    /// Registers a callback run on the entity state after each set.
    pub fn with_changed(mut self, changed: FieldChanged) -> Self {
        self.changed = Some(changed);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn phase(&self) -> FieldPhase {
        self.phase
    }

    pub fn default_value(&self) -> &FieldValue {
        &self.default
    }

    pub(crate) fn read(&self, state: &dyn EntityState) -> FieldValue {
        (self.get)(state)
    }

    pub(crate) fn write(
        &self,
        state: &mut dyn EntityState,
        value: &FieldValue,
    ) -> Result<(), StructuralError> {
        (self.set)(state, value)?;
        if let Some(changed) = self.changed {
            changed(state);
        }
        Ok(())
    }
}

impl std::fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Type Registry
// ============================================================================

/// Key of a registered entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey(usize);

/// Registration record for one concrete entity type: name, state
/// constructor, behavior, capabilities, and the ordered field table.
pub struct TypeInfo {
    name: &'static str,
    make_state: fn() -> Box<dyn EntityState>,
    behavior: Arc<dyn Behavior>,
    capabilities: CapabilitySet,
    fields: Vec<FieldDef>,
}

impl TypeInfo {
    pub fn new(
        name: &'static str,
        make_state: fn() -> Box<dyn EntityState>,
        behavior: Arc<dyn Behavior>,
    ) -> Self {
        Self {
            name,
            make_state,
            behavior,
            capabilities: CapabilitySet::default(),
            fields: Vec::new(),
        }
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap);
        self
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn behavior(&self) -> Arc<dyn Behavior> {
        Arc::clone(&self.behavior)
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Position of a field in the table, by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub(crate) fn new_state(&self) -> Box<dyn EntityState> {
        (self.make_state)()
    }
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// Process-wide registry of entity types, built once at startup before any
/// model is instantiated.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
    by_name: HashMap<&'static str, TypeKey>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type; names must be unique.
    pub fn register(&mut self, info: TypeInfo) -> Result<TypeKey, StructuralError> {
        if self.by_name.contains_key(info.name) {
            return Err(StructuralError::DuplicateType(info.name.to_string()));
        }
        let key = TypeKey(self.types.len());
        self.by_name.insert(info.name, key);
        self.types.push(info);
        Ok(key)
    }

    pub fn get(&self, key: TypeKey) -> &TypeInfo {
        &self.types[key.0]
    }

    /// Looks a type up by name.
    pub fn lookup(&self, name: &str) -> Option<TypeKey> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
