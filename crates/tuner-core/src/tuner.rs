//! Circular tuning over the station list plus the transient "tuning" flag.
//!
//! The flag is a UI hint only.  Every raise bumps `epoch`; the scheduled
//! clear carries the epoch it was armed with and is ignored if a later tune
//! step re-armed the flag in the meantime.

pub fn step_up(idx: usize, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some((idx + 1) % len)
}

pub fn step_down(idx: usize, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some((idx % len + len - 1) % len)
}

#[derive(Debug, Default)]
pub struct Tuner {
    tuning: bool,
    epoch: u64,
}

impl Tuner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tuning(&self) -> bool {
        self.tuning
    }

    /// Raise the flag; returns the epoch to hand back to `settle`.
    pub fn begin(&mut self) -> u64 {
        self.tuning = true;
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    /// Lower the flag if `epoch` is still the latest raise.
    pub fn settle(&mut self, epoch: u64) -> bool {
        if self.tuning && epoch == self.epoch {
            self.tuning = false;
            return true;
        }
        false
    }
}
