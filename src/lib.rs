//! Warden - role hierarchy and attribute based authorization service
//!
//! Decides whether a principal may act on a resource, plans the same policy
//! into database filters, and keeps an audit trail and metrics for every
//! decision.

pub mod authz;
pub mod errors;
pub mod settings;
pub mod web;
