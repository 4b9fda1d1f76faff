use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::timer_queue::{TimerError, TimerId, TimerQueue};

/// A device's single reschedulable wake-up.
///
/// Arming replaces any previously armed deadline; there is never more than one outstanding
/// deadline per handle.
pub trait Wakeup {
    fn arm(&mut self, deadline_ns: u64);
    fn cancel(&mut self);
}

impl<W: Wakeup + ?Sized> Wakeup for Box<W> {
    fn arm(&mut self, deadline_ns: u64) {
        (**self).arm(deadline_ns);
    }

    fn cancel(&mut self) {
        (**self).cancel();
    }
}

/// Wake-up slot that the owner polls directly, for devices not driven by a [`TimerQueue`].
///
/// Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct OneShotWakeup {
    deadline_ns: Rc<Cell<Option<u64>>>,
}

impl OneShotWakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline_ns.get()
    }

    /// Disarms and returns `true` if the armed deadline is `<= now_ns`.
    pub fn take_due(&self, now_ns: u64) -> bool {
        match self.deadline_ns.get() {
            Some(deadline) if deadline <= now_ns => {
                self.deadline_ns.set(None);
                true
            }
            _ => false,
        }
    }
}

impl Wakeup for OneShotWakeup {
    fn arm(&mut self, deadline_ns: u64) {
        self.deadline_ns.set(Some(deadline_ns));
    }

    fn cancel(&mut self) {
        self.deadline_ns.set(None);
    }
}

/// Wake-up backed by a shared [`TimerQueue`]; fired events carry `tag` so the queue owner can
/// route them back to the device.
pub struct QueuedWakeup<T: Clone> {
    queue: Rc<RefCell<TimerQueue<T>>>,
    tag: T,
    armed: Option<TimerId>,
}

impl<T: Clone> QueuedWakeup<T> {
    pub fn new(queue: Rc<RefCell<TimerQueue<T>>>, tag: T) -> Self {
        Self {
            queue,
            tag,
            armed: None,
        }
    }

    /// The pending deadline, if the wake-up is armed and has not fired yet.
    pub fn deadline(&self) -> Option<u64> {
        let id = self.armed?;
        self.queue.borrow().deadline(id)
    }
}

impl<T: Clone> Wakeup for QueuedWakeup<T> {
    fn arm(&mut self, deadline_ns: u64) {
        let mut queue = self.queue.borrow_mut();
        if let Some(id) = self.armed {
            match queue.reschedule(id, deadline_ns) {
                Ok(()) => return,
                // Already fired and drained by the queue owner.
                Err(TimerError::NotPending(_)) => {}
            }
        }
        self.armed = Some(queue.schedule(deadline_ns, self.tag.clone()));
    }

    fn cancel(&mut self) {
        if let Some(id) = self.armed.take() {
            self.queue.borrow_mut().cancel(id);
        }
    }
}
