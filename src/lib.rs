//! Admission Governor - per-identity request pacing and rejection
//!
//! This crate implements a request-admission filter for HTTP services. Each
//! request is matched against an ordered rule catalog; governed requests are
//! counted per caller identity in fixed time windows, and the previous
//! window's count decides whether the request proceeds now, proceeds after a
//! pacing delay, or is rejected.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
