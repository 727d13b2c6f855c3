//! Collaborator surfaces for the pieces spec.md §1 names as explicitly out
//! of scope for this crate: the Kubernetes CRD controller that mints
//! service tokens into `Secret` objects, and whatever alerting channel a
//! deployment wires up for operational failures (the original's Slack
//! webhook). Neither collaborator is implemented here; these modules are
//! the narrow interface the core exposes so an external binary can drive
//! it without reaching into [`crate::token`] internals.

pub mod alerter;
pub mod kubernetes;

pub use alerter::{Alerter, LoggingAlerter, NullAlerter};
pub use kubernetes::ServiceTokenMinter;
