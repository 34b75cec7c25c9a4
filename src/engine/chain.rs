//! Read-side view of a reasoning chain with revisions applied.

use std::collections::HashMap;

use crate::storage::Step;

/// Collapse revisions so each logical position shows its latest step.
///
/// Input is expected in store order (per branch, ascending `step_number`).
/// A step revising `k` takes over the slot `k` occupies, including when `k`
/// was itself a revision. A revision whose target is missing opens a new
/// slot. Branches are kept apart; slots appear in first-seen order.
pub fn current_chain(steps: &[Step]) -> Vec<Step> {
    let mut slots: Vec<Step> = Vec::with_capacity(steps.len());
    let mut slot_of: HashMap<(Option<&str>, u32), usize> = HashMap::new();

    for step in steps {
        let branch = step.branch_id.as_deref();
        let target = step
            .revises_step
            .and_then(|revised| slot_of.get(&(branch, revised)).copied());

        let slot = match target {
            Some(slot) => {
                slots[slot] = step.clone();
                slot
            }
            None => {
                slots.push(step.clone());
                slots.len() - 1
            }
        };
        slot_of.insert((branch, step.step_number), slot);
    }

    slots
}
