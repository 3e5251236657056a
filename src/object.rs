//! Suspension state shared by queues and event sources.
//!
//! Two independent switches pause an object:
//!
//! - `suspend`/`resume` nest: the object runs again only after as many
//!   resumes as suspends.
//! - `disable`/`enable` do not nest: one enable undoes any number of disables.
//!
//! The object is paused while either switch is engaged.

/// Pause bookkeeping of a dispatch object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PauseState {
    suspend_count: usize,
    disabled: bool,
}

impl PauseState {
    /// A state that starts disabled, as event sources do.
    pub(crate) fn disabled() -> Self {
        Self {
            suspend_count: 0,
            disabled: true,
        }
    }

    pub(crate) fn suspend(&mut self) {
        self.suspend_count += 1;
    }

    /// Balances one [`suspend`](Self::suspend).
    ///
    /// # Returns
    /// `false` if the object was not suspended; the count stays at zero.
    pub(crate) fn resume(&mut self) -> bool {
        match self.suspend_count.checked_sub(1) {
            Some(count) => {
                self.suspend_count = count;
                true
            }
            None => false,
        }
    }

    pub(crate) fn disable(&mut self) {
        self.disabled = true;
    }

    pub(crate) fn enable(&mut self) {
        self.disabled = false;
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.is_suspended() || self.disabled
    }
}

