pub mod handler;

pub use handler::{HttpTaskHandler, StepOutcome, TaskHandler};
