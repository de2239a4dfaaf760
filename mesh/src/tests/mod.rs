//! Internal tests module
//!
//! Multi-peer scenarios that run several sessions over an in-memory network
//! and have full access to crate internals.
