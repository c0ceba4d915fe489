//! Splitting a run of updates into size-bounded delta batches.

use heapcast_core::heap::Update;

/// Group `updates` in order into batches of at most `max_actions` actions.
///
/// Updates are never split. A batch is closed before an update that would push
/// it over the limit, and an update larger than the limit travels alone.
pub(crate) fn partition(updates: Vec<Update>, max_actions: usize) -> Vec<Vec<Update>> {
    let mut batches = Vec::new();
    let mut current: Vec<Update> = Vec::new();
    let mut count = 0;
    for update in updates {
        let n = update.len();
        if !current.is_empty() && count + n > max_actions {
            batches.push(std::mem::take(&mut current));
            count = 0;
        }
        count += n;
        current.push(update);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
