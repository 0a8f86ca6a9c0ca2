//! Built-in demonstration model for the headless sweep binary and the
//! integration tests: a source entity spawns generated items from a
//! prototype template on a fixed cadence, jitters their weight from the
//! replication stream, and retires them through the reuse pool.

use std::sync::Arc;

use rand::Rng;

use tephra_kernel::{
    Action, ActionError, Behavior, EntityState, FieldDef, Flow, ModelBlueprint, ModelCtx,
    StructuralError, TypeInfo, TypeRegistry,
};
use tephra_types::{EntityId, FieldValue, OutputValue};

// ============================================================================
// Item
// ============================================================================

struct ItemState {
    weight: f64,
}

impl Default for ItemState {
    fn default() -> Self {
        Self { weight: 1.0 }
    }
}

fn get_weight(s: &dyn EntityState) -> FieldValue {
    FieldValue::Real(s.downcast_ref::<ItemState>().map_or(0.0, |i| i.weight))
}

fn set_weight(s: &mut dyn EntityState, v: &FieldValue) -> Result<(), StructuralError> {
    let FieldValue::Real(w) = v else {
        return Err(StructuralError::FieldType {
            field: "weight".to_string(),
            expected: "real",
            actual: v.kind(),
        });
    };
    if let Some(item) = s.downcast_mut::<ItemState>() {
        item.weight = *w;
    }
    Ok(())
}

/// Items carry no behavior; they exist to exercise the clone pool.
struct Item;

impl Behavior for Item {}

// ============================================================================
// Source
// ============================================================================

struct SourceState {
    template: EntityId,
    interval: i64,
    batch: i64,
    emitted: u64,
    weight_sum: f64,
}

impl Default for SourceState {
    fn default() -> Self {
        Self {
            template: EntityId::new(0),
            interval: 10,
            batch: 1,
            emitted: 0,
            weight_sum: 0.0,
        }
    }
}

fn get_template(s: &dyn EntityState) -> FieldValue {
    FieldValue::EntityRef(
        s.downcast_ref::<SourceState>()
            .map_or(EntityId::new(0), |src| src.template),
    )
}

fn set_template(s: &mut dyn EntityState, v: &FieldValue) -> Result<(), StructuralError> {
    let FieldValue::EntityRef(id) = v else {
        return Err(StructuralError::FieldType {
            field: "template".to_string(),
            expected: "entity",
            actual: v.kind(),
        });
    };
    if let Some(src) = s.downcast_mut::<SourceState>() {
        src.template = *id;
    }
    Ok(())
}

fn get_interval(s: &dyn EntityState) -> FieldValue {
    FieldValue::Integer(s.downcast_ref::<SourceState>().map_or(0, |src| src.interval))
}

fn set_interval(s: &mut dyn EntityState, v: &FieldValue) -> Result<(), StructuralError> {
    let FieldValue::Integer(i) = v else {
        return Err(StructuralError::FieldType {
            field: "interval".to_string(),
            expected: "integer",
            actual: v.kind(),
        });
    };
    if let Some(src) = s.downcast_mut::<SourceState>() {
        src.interval = *i;
    }
    Ok(())
}

fn get_batch(s: &dyn EntityState) -> FieldValue {
    FieldValue::Integer(s.downcast_ref::<SourceState>().map_or(0, |src| src.batch))
}

fn set_batch(s: &mut dyn EntityState, v: &FieldValue) -> Result<(), StructuralError> {
    let FieldValue::Integer(i) = v else {
        return Err(StructuralError::FieldType {
            field: "batch".to_string(),
            expected: "integer",
            actual: v.kind(),
        });
    };
    if let Some(src) = s.downcast_mut::<SourceState>() {
        src.batch = *i;
    }
    Ok(())
}

/// Spawns a batch of items from the template each interval, weights them
/// from the replication stream, and retires them through the pool.
struct Source;

impl Behavior for Source {
    fn on_event(
        &self,
        ctx: &mut ModelCtx<'_>,
        me: EntityId,
        action: Action,
    ) -> Result<Flow, ActionError> {
        if action == Action::ClearStatistics {
            if let Some(state) = ctx
                .registry
                .get_mut(me)
                .and_then(|e| e.state_mut().downcast_mut::<SourceState>())
            {
                state.emitted = 0;
                state.weight_sum = 0.0;
            }
            return Ok(Flow::Done);
        }

        let (template, interval, batch) = {
            let state = ctx
                .registry
                .get(me)
                .and_then(|e| e.state().downcast_ref::<SourceState>())
                .ok_or_else(|| ActionError::new("source state missing"))?;
            (state.template, state.interval, state.batch)
        };
        if template == EntityId::new(0) {
            return Err(ActionError::new("source has no template"));
        }

        let mut weight_sum = 0.0;
        for _ in 0..batch.max(0) {
            let item = ctx.spawn_clone(template)?;
            let weight = ctx.rng.gen_range(0.5..1.5);
            ctx.registry
                .set_field(item, "weight", &FieldValue::Real(weight))?;
            weight_sum += weight;
            ctx.dispose(item)?;
        }
        if let Some(state) = ctx
            .registry
            .get_mut(me)
            .and_then(|e| e.state_mut().downcast_mut::<SourceState>())
        {
            state.emitted += batch.max(0) as u64;
            state.weight_sum += weight_sum;
        }
        Ok(Flow::delay(interval.max(1) as u64))
    }

    fn do_end(&self, ctx: &mut ModelCtx<'_>, me: EntityId) -> Result<(), ActionError> {
        let (emitted, weight_sum) = ctx
            .registry
            .get(me)
            .and_then(|e| e.state().downcast_ref::<SourceState>())
            .map_or((0, 0.0), |s| (s.emitted, s.weight_sum));
        ctx.record_output("items_emitted", OutputValue::Number(emitted as f64));
        // NaN when nothing was emitted; the aggregator skips it.
        ctx.record_output(
            "mean_weight",
            OutputValue::Number(weight_sum / emitted as f64),
        );
        Ok(())
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Type registry of the demonstration model.
pub fn demo_types() -> Arc<TypeRegistry> {
    let mut types = TypeRegistry::new();
    types
        .register(
            TypeInfo::new("Item", || Box::new(ItemState::default()), Arc::new(Item))
                .with_field(FieldDef::late(
                    "weight",
                    FieldValue::Real(1.0),
                    get_weight,
                    set_weight,
                )),
        )
        .expect("Item registers once");
    types
        .register(
            TypeInfo::new(
                "Source",
                || Box::new(SourceState::default()),
                Arc::new(Source),
            )
            .with_field(FieldDef::early(
                "template",
                FieldValue::EntityRef(EntityId::new(0)),
                get_template,
                set_template,
            ))
            .with_field(FieldDef::late(
                "interval",
                FieldValue::Integer(10),
                get_interval,
                set_interval,
            ))
            .with_field(FieldDef::late(
                "batch",
                FieldValue::Integer(1),
                get_batch,
                set_batch,
            )),
        )
        .expect("Source registers once");
    Arc::new(types)
}

/// Blueprint of the demonstration model: one item template, one source.
pub fn demo_blueprint() -> ModelBlueprint {
    ModelBlueprint::new()
        .define("Item", "template")
        .define("Source", "source")
        .set_ref("source", "template", "template")
        .set("source", "interval", FieldValue::Integer(7))
        .set("source", "batch", FieldValue::Integer(2))
}
