use anyhow::Result;
use tracing::debug;

use crate::error::best_effort;

type Compensation<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Compensating actions registered as side effects succeed.
///
/// On failure they run newest first; their own failures are only logged.
pub struct Rollback<'a> {
    steps: Vec<(String, Compensation<'a>)>,
}

impl<'a> Default for Rollback<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Rollback<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, what: impl Into<String>, undo: impl FnOnce() -> Result<()> + 'a) {
        self.steps.push((what.into(), Box::new(undo)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every compensation in reverse registration order.
    pub fn unwind(mut self) {
        while let Some((what, undo)) = self.steps.pop() {
            debug!("rolling back: {}", what);
            best_effort(format!("cleanup ({})", what), undo());
        }
    }

    /// Forget the compensations; the work they undo is kept.
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    /// Disarm on `Ok`, unwind on `Err`, passing the result through.
    pub fn settle<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.disarm();
                Ok(value)
            }
            Err(err) => {
                self.unwind();
                Err(err)
            }
        }
    }
}
