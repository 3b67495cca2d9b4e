//! Admission API
//!
//! HTTP surface of the validation gate.

pub mod server;
pub mod webhook;

pub use server::*;
pub use webhook::*;
