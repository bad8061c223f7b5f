use tracing::{debug, trace};

/// Capability that knows how to tear down one kind of retired object.
///
/// Destruction may need several ticks (GPU fences, render-thread release),
/// so the queue asks before finishing instead of assuming.
pub trait DestructionReadiness<T> {
    /// Start destruction. Called exactly once per item.
    fn begin_destroy(&mut self, item: &mut T);

    fn is_ready_for_finish(&mut self, item: &T) -> bool;

    fn finish_destroy(&mut self, item: T);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructionStage {
    Pending,
    InProgress,
}

#[derive(Debug)]
struct RetiredEntry<T> {
    item: T,
    stage: DestructionStage,
    polls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DestructionPumpReport {
    pub started: usize,
    pub finished: usize,
    pub still_pending: usize,
}

/// Objects whose teardown spans ticks. Drained once per owner-thread tick.
#[derive(Debug)]
pub struct DeferredDestructionQueue<T> {
    entries: Vec<RetiredEntry<T>>,
}

impl<T> Default for DeferredDestructionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferredDestructionQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Queue an item without touching it; the next pump starts destruction.
    pub fn enqueue(&mut self, item: T) {
        self.entries.push(RetiredEntry {
            item,
            stage: DestructionStage::Pending,
            polls: 0,
        });
    }

    /// Try to destroy right away, queueing whatever cannot finish yet.
    /// Returns `true` when the item was fully destroyed.
    #[cfg(test)]
    fn destroy(&mut self, mut item: T, readiness: &mut impl DestructionReadiness<T>) -> bool {
        readiness.begin_destroy(&mut item);
        if readiness.is_ready_for_finish(&item) {
            readiness.finish_destroy(item);
            return true;
        }
        self.entries.push(RetiredEntry {
            item,
            stage: DestructionStage::InProgress,
            polls: 1,
        });
        false
    }

    pub fn pump(&mut self, readiness: &mut impl DestructionReadiness<T>) -> DestructionPumpReport {
        let mut report = DestructionPumpReport::default();
        let mut remaining = Vec::with_capacity(self.entries.len());

        for mut entry in self.entries.drain(..) {
            if entry.stage == DestructionStage::Pending {
                readiness.begin_destroy(&mut entry.item);
                entry.stage = DestructionStage::InProgress;
                report.started += 1;
            }
            entry.polls += 1;
            if readiness.is_ready_for_finish(&entry.item) {
                readiness.finish_destroy(entry.item);
                report.finished += 1;
                continue;
            }
            trace!(polls = entry.polls, "retired object not ready to finish");
            remaining.push(entry);
        }

        self.entries = remaining;
        report.still_pending = self.entries.len();
        if report.finished > 0 {
            debug!(
                finished = report.finished,
                pending = report.still_pending,
                "deferred destruction progressed"
            );
        }
        report
    }

    /// Objects whose destruction has not finished. A scene is not fully
    /// destroyed until this reaches zero.
    pub fn pending_destruction_count(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn stage_counts(&self) -> (usize, usize) {
        let pending = self
            .entries
            .iter()
            .filter(|entry| entry.stage == DestructionStage::Pending)
            .count();
        (pending, self.entries.len() - pending)
    }

    pub fn is_drained(&self) -> bool {
        self.entries.is_empty()
    }
}
