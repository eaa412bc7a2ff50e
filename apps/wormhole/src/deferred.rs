use std::collections::VecDeque;

/// Actions held back until a one-shot readiness signal fires.
///
/// Before [`Deferred::fire`] every action is queued in arrival order. Firing
/// releases the queue once, and from then on actions pass straight through.
#[derive(Debug)]
pub struct Deferred<A> {
    ready: bool,
    queue: VecDeque<A>,
}

impl<A> Default for Deferred<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Deferred<A> {
    pub fn new() -> Self {
        Self {
            ready: false,
            queue: VecDeque::new(),
        }
    }

    #[cfg(test)]
    fn is_ready(&self) -> bool {
        self.ready
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Returns the action back when it may run now, otherwise queues it.
    pub fn defer(&mut self, action: A) -> Option<A> {
        if self.ready {
            Some(action)
        } else {
            self.queue.push_back(action);
            None
        }
    }

    /// Marks the signal as fired and returns everything queued so far.
    /// Later calls return nothing.
    pub fn fire(&mut self) -> Vec<A> {
        if self.ready {
            return Vec::new();
        }
        self.ready = true;
        self.queue.drain(..).collect()
    }
}
