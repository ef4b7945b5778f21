use crate::HalResult;

type Compensation<'a> = Box<dyn FnOnce() -> HalResult<()> + 'a>;

/// Stack of compensating actions for the external steps of one transaction.
///
/// Each successful step pushes the action that undoes it. [`Rollback::commit`] discards the
/// stack once the transaction is durable; [`Rollback::run`] undoes everything in reverse order.
/// A guard dropped without either (early return, panic) runs the stack and logs failures.
pub struct Rollback<'a> {
    steps: Vec<(String, Compensation<'a>)>,
}

impl<'a> Rollback<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce() -> HalResult<()> + 'a,
    ) {
        self.steps.push((label.into(), Box::new(action)));
    }

    /// Keep every completed step.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Undo completed steps, last first. Returns a description of each compensation that failed.
    pub fn run(mut self) -> Vec<String> {
        self.unwind()
    }

    fn unwind(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some((label, action)) = self.steps.pop() {
            log::warn!("rolling back: {}", label);
            if let Err(err) = action() {
                log::error!("rollback step '{}' failed: {}", label, err);
                failures.push(format!("{}: {}", label, err));
            }
        }
        failures
    }
}

impl Default for Rollback<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            let _ = self.unwind();
        }
    }
}
