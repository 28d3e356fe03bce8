//! Shared vocabulary of the weft fiber runtime.
//!
//! This crate provides the canonical definitions for the types that travel
//! across the public API boundary: fiber identifiers, attributes, states and
//! the error taxonomy. Having a single source of truth keeps the scheduler
//! core and embedding code from drifting apart.
//!
//! Nothing in here touches the scheduler; everything is plain data.

#![no_std]
#![forbid(unsafe_code)]

pub mod error;
pub mod fiber;

pub use error::*;
pub use fiber::*;
