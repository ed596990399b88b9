// src/dag/mod.rs

//! Dependency graph of resources.
//!
//! - [`graph`] holds the refs-induced DAG used by the catalog for
//!   parent/child lookups, descendant walks and cycle rejection.

pub mod graph;

pub use graph::Dag;
