pub mod engine;
pub mod poll;
pub mod retrieve;
mod steps;
pub mod transform;
pub mod transition;

pub use engine::{StageEngine, StageEngineBuilder};
pub use transition::{StepOutcome, Transition, default_target};
