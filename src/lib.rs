//! Arbor - hierarchical role-based authorization
//!
//! Compiles declarative resource, role and relationship facts into an
//! immutable policy snapshot and answers point checks and bulk filters with
//! recursive SQL over live role assignments.

pub mod authz;
pub mod entities;
pub mod errors;
pub mod settings;
pub mod storage;
pub mod web;
