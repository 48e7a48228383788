use crate::store::dao::types::WorkStatus;
use crate::util::error::WorkError;

/// Result of running one transition body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The requested target was reached.
    Continue,
    /// The body wants the driver to re-enter with a different target.
    RedirectTo(WorkStatus),
}

/// The accepted `(from, to)` pairs, by what they do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `Created -> Checked`
    Submit,
    /// `Checked -> Checked`
    Check,
    /// Any non-terminal status to a terminal one.
    Finish(WorkStatus),
}

impl Transition {
    /// # Errors
    /// `WorkError::InvalidTransition` for every pair outside the table.
    pub fn classify(from: WorkStatus, to: WorkStatus) -> Result<Self, WorkError> {
        match (from, to) {
            (WorkStatus::Created, WorkStatus::Checked) => Ok(Transition::Submit),
            (WorkStatus::Checked, WorkStatus::Checked) => Ok(Transition::Check),
            (from, to) if !from.is_terminal() && to.is_terminal() => Ok(Transition::Finish(to)),
            (from, to) => Err(WorkError::InvalidTransition { from, to }),
        }
    }

    #[must_use]
    pub fn target(self) -> WorkStatus {
        match self {
            Transition::Submit | Transition::Check => WorkStatus::Checked,
            Transition::Finish(to) => to,
        }
    }
}

/// Where a plain re-invocation (no explicit target) takes a work next.
#[must_use]
pub fn default_target(status: WorkStatus) -> Option<WorkStatus> {
    match status {
        WorkStatus::Created | WorkStatus::Checked => Some(WorkStatus::Checked),
        WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Canceled => None,
    }
}
