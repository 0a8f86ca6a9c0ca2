//! Model blueprints: the recorded entity-definition and input-copy
//! sequence.
//!
//! The configuration layer hands the kernel construction requests as plain
//! data ops. Replaying the same op list builds an identical model
//! instance, which is how the orchestrator produces one independent copy
//! per worker thread without re-parsing configuration.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tephra_types::{EntityFlags, FieldValue};

use crate::controller::{ModelConfig, ModelController};
use crate::error::StructuralError;
use crate::field::TypeRegistry;

/// One recorded construction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefineOp {
    /// "Define entity `name` of type `type_name`", with optional prototype
    /// and parent referenced by earlier-defined names.
    Define {
        type_name: String,
        name: String,
        prototype: Option<String>,
        parent: Option<String>,
        flags: EntityFlags,
    },
    /// "Set field `field` of entity `entity` to `value`".
    Set {
        entity: String,
        field: String,
        value: FieldValue,
    },
    /// "Set entity-reference field `field` of `entity` to the entity
    /// defined as `target`". References resolve at replay time, so the op
    /// list stays identity-free and replayable.
    SetRef {
        entity: String,
        field: String,
        target: String,
    },
}

/// An ordered, replayable op list describing one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelBlueprint {
    ops: Vec<DefineOp>,
}

impl ModelBlueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a definition of a load-time, name-indexed entity.
    pub fn define(mut self, type_name: &str, name: &str) -> Self {
        self.ops.push(DefineOp::Define {
            type_name: type_name.to_string(),
            name: name.to_string(),
            prototype: None,
            parent: None,
            flags: EntityFlags::REGISTERED,
        });
        self
    }

    /// Records a definition with full control over edges and flags.
    pub fn define_with(
        mut self,
        type_name: &str,
        name: &str,
        prototype: Option<&str>,
        parent: Option<&str>,
        flags: EntityFlags,
    ) -> Self {
        self.ops.push(DefineOp::Define {
            type_name: type_name.to_string(),
            name: name.to_string(),
            prototype: prototype.map(str::to_string),
            parent: parent.map(str::to_string),
            flags,
        });
        self
    }

    /// Records a field-set request.
    pub fn set(mut self, entity: &str, field: &str, value: FieldValue) -> Self {
        self.ops.push(DefineOp::Set {
            entity: entity.to_string(),
            field: field.to_string(),
            value,
        });
        self
    }

    /// Records an entity-reference field set, resolved by name at replay.
    pub fn set_ref(mut self, entity: &str, field: &str, target: &str) -> Self {
        self.ops.push(DefineOp::SetRef {
            entity: entity.to_string(),
            field: field.to_string(),
            target: target.to_string(),
        });
        self
    }

    pub fn ops(&self) -> &[DefineOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Replays the op list into a fresh model instance.
    pub fn instantiate(
        &self,
        types: &Arc<TypeRegistry>,
        config: ModelConfig,
    ) -> Result<ModelController, StructuralError> {
        let mut controller = ModelController::new(Arc::clone(types), config);
        let mut by_name = HashMap::new();

        for op in &self.ops {
            match op {
                DefineOp::Define {
                    type_name,
                    name,
                    prototype,
                    parent,
                    flags,
                } => {
                    let proto_id = match prototype {
                        Some(p) => Some(
                            by_name
                                .get(p.as_str())
                                .copied()
                                .ok_or_else(|| StructuralError::UnknownEntityName(p.clone()))?,
                        ),
                        None => None,
                    };
                    let parent_id = match parent {
                        Some(p) => Some(
                            by_name
                                .get(p.as_str())
                                .copied()
                                .ok_or_else(|| StructuralError::UnknownEntityName(p.clone()))?,
                        ),
                        None => None,
                    };
                    let id = controller.registry_mut().define(
                        type_name,
                        name,
                        proto_id,
                        parent_id,
                        *flags,
                    )?;
                    by_name.insert(name.clone(), id);
                }
                DefineOp::Set {
                    entity,
                    field,
                    value,
                } => {
                    let id = by_name
                        .get(entity.as_str())
                        .copied()
                        .ok_or_else(|| StructuralError::UnknownEntityName(entity.clone()))?;
                    controller.registry_mut().set_field(id, field, value)?;
                }
                DefineOp::SetRef {
                    entity,
                    field,
                    target,
                } => {
                    let id = by_name
                        .get(entity.as_str())
                        .copied()
                        .ok_or_else(|| StructuralError::UnknownEntityName(entity.clone()))?;
                    let target_id = by_name
                        .get(target.as_str())
                        .copied()
                        .ok_or_else(|| StructuralError::UnknownEntityName(target.clone()))?;
                    controller.registry_mut().set_field(
                        id,
                        field,
                        &FieldValue::EntityRef(target_id),
                    )?;
                }
            }
        }
        Ok(controller)
    }
}
