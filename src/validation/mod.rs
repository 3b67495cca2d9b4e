//! Pre-commit validation of desired-state edits

pub mod gate;
pub mod steps;

pub use gate::{AdmissionVerdict, Operation, ReviewRequest, ReviewTarget, ValidationGate};
pub use steps::{StructuralStep, UpdateStep};
