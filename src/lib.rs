//! Purpose: Private per-instance and per-type attribute stores, optionally shared across processes.
//! Exports: `api` (stable store surface), `core` (keys, sessions, backends, errors).
//! Role: Library backing the `private-attrs` CLI and any type that keeps state out of its own fields.
//! Invariants: One `Store` per type; instances reach their attributes only through that store.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod session_paths;
