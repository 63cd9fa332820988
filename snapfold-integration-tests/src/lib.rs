//! Integration tests for `snapfold`
//!
//! This crate contains integration tests that exercise the aggregation
//! engine end to end against the in-memory storage collaborators.

// This is a test-only crate
#![cfg(test)]
