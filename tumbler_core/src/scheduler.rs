use rand_core::RngCore;

/// A `Scheduler` picks which queued input the engine mutates next.
pub trait Scheduler: Send {
    /// Returns the index of the next parent in a queue of `queue_len` entries, or
    /// `None` when the queue is empty.
    fn next(&mut self, queue_len: usize, rng: &mut dyn RngCore) -> Option<usize>;

    /// Tells the scheduler whether mutating `parent` produced an interesting input.
    fn report_feedback(&mut self, parent: usize, interesting: bool);
}

/// Selects parents uniformly at random and ignores feedback.
#[derive(Default, Debug)]
pub struct RandomScheduler;

impl RandomScheduler {
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl Scheduler for RandomScheduler {
    fn next(&mut self, queue_len: usize, rng: &mut dyn RngCore) -> Option<usize> {
        if queue_len == 0 {
            return None;
        }
        Some(rng.next_u64() as usize % queue_len)
    }

    fn report_feedback(&mut self, _parent: usize, _interesting: bool) {}
}

/// Walks the queue in order, staying on a parent for a fixed number of children
/// and granting extra children to parents whose mutants were interesting.
#[derive(Debug)]
pub struct CyclingScheduler {
    cursor: usize,
    remaining: u32,
    children_per_parent: u32,
    cycles: u32,
}

impl CyclingScheduler {
    pub fn new(children_per_parent: u32) -> Self {
        let children_per_parent = children_per_parent.max(1);
        Self {
            cursor: 0,
            remaining: children_per_parent,
            children_per_parent,
            cycles: 0,
        }
    }

    pub fn cycles_completed(&self) -> u32 {
        self.cycles
    }
}

impl Default for CyclingScheduler {
    fn default() -> Self {
        Self::new(32)
    }
}

impl Scheduler for CyclingScheduler {
    fn next(&mut self, queue_len: usize, _rng: &mut dyn RngCore) -> Option<usize> {
        if queue_len == 0 {
            return None;
        }
        if self.remaining == 0 {
            self.cursor += 1;
            self.remaining = self.children_per_parent;
        }
        if self.cursor >= queue_len {
            self.cursor = 0;
            self.cycles = self.cycles.saturating_add(1);
        }
        self.remaining -= 1;
        Some(self.cursor)
    }

    fn report_feedback(&mut self, parent: usize, interesting: bool) {
        if interesting && parent == self.cursor {
            self.remaining = self.remaining.saturating_add(self.children_per_parent / 2);
        }
    }
}
