pub mod outcome;

pub use outcome::{Disposition, ProcessingOutcome};
