//! Queue matching.
//!
//! Every registration is checked against the live queue at its turn in the
//! pass. Earlier registrations in the same pass have already removed what
//! they claimed, so two registrations can never be handed the same instance.

use std::collections::VecDeque;

use cascade_events::{EventKey, WorkflowEvent};

/// Select the earliest queued instance for each position of `required`,
/// never picking the same instance twice. Removes and returns the selection
/// in tuple order, or leaves the queue untouched when any position is
/// unsatisfiable.
pub(crate) fn claim(
    queue: &mut VecDeque<WorkflowEvent>,
    required: &[EventKey],
) -> Option<Vec<WorkflowEvent>> {
    if required.is_empty() {
        return None;
    }

    let mut picked: Vec<usize> = Vec::with_capacity(required.len());
    for key in required {
        let index = queue
            .iter()
            .enumerate()
            .position(|(i, event)| event.key() == *key && !picked.contains(&i))?;
        picked.push(index);
    }

    let inputs: Vec<WorkflowEvent> = picked.iter().map(|&i| queue[i].clone()).collect();

    let mut removal = picked;
    removal.sort_unstable_by(|a, b| b.cmp(a));
    for index in removal {
        queue.remove(index);
    }

    Some(inputs)
}
