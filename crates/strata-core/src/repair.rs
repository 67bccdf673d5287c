//! Post-rehydration link repair
//!
//! Some object pairs point at each other, such as a plan element and the task
//! it expands to. Deltas may carry the two halves from different epochs, so
//! after replay the back-pointer can disagree with the forward pointer. The
//! forward pointer wins. A repaired back-pointer is a [`Value::Link`], so the
//! pair never owns itself.

use serde::{Deserialize, Serialize};

use crate::object::{ManagedObject, ObjectHandle, Value};

/// `kind.forward_field` → target, and `target.back_field` must point back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRule {
    pub kind: String,
    pub forward_field: String,
    pub back_field: String,
}

impl LinkRule {
    pub fn new(
        kind: impl Into<String>,
        forward_field: impl Into<String>,
        back_field: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            forward_field: forward_field.into(),
            back_field: back_field.into(),
        }
    }

    /// `plan_element.task` ↔ `task.plan_element`
    pub fn plan_element_task() -> Self {
        Self::new("plan_element", "task", "plan_element")
    }

    /// Repair one object. Returns `true` if the target's back-pointer was rewritten.
    fn apply(&self, object: &ObjectHandle) -> bool {
        if object.kind() != self.kind {
            return false;
        }
        let Some(target) = object.get(&self.forward_field).and_then(|v| v.target()) else {
            return false;
        };
        let consistent = target
            .get(&self.back_field)
            .and_then(|v| v.target())
            .is_some_and(|back| ManagedObject::same(&back, object));
        if consistent {
            return false;
        }

        tracing::warn!(
            kind = %self.kind,
            object = %object.key(),
            target = %target.key(),
            field = %self.back_field,
            "Repairing inconsistent back-pointer"
        );
        target.set(self.back_field.clone(), Value::link(object));
        true
    }
}

/// Apply every rule to every object. Returns the number of repaired links.
pub fn repair_links(objects: &[ObjectHandle], rules: &[LinkRule]) -> usize {
    let mut repaired = 0;
    for object in objects {
        for rule in rules {
            if rule.apply(object) {
                repaired += 1;
            }
        }
    }
    repaired
}
