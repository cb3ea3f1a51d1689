//! Conflict detection and resolution for Orchard.
//!
//! Detection is a three-way comparison among the object (local intent), its
//! shadow (last known remote), and the newly observed remote state;
//! resolution maps the detected case through the configured policy to a
//! concrete plan the sync engine executes.

mod detector;
mod resolver;

pub use detector::{assess, local_changed, remote_state, Assessment, ConflictKind, RemoteState};
pub use resolver::{plan, ResolutionPlan};
