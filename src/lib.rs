//! `bulkapi` dispatch library.
//!
//! A bulk request encodes many API calls in one parameter map. This crate
//! expands it into calls (`request`, `normalize`), lets each module merge its
//! own calls (`rules`, `grouping`), cuts merges at credential boundaries
//! (`split`), runs the result in order (`execute`, `merge`) and renders the
//! reply (`response`). `dispatch` ties the stages together.
//!
//! Invariants:
//! - one result per call, in call order
//! - calls run strictly one after another, lowest index first
//! - the first failure ends the request and discards earlier results

pub mod auth;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod execute;
pub mod grouping;
pub mod merge;
pub mod normalize;
pub mod plan;
pub mod remote;
pub mod request;
pub mod response;
pub mod rules;
pub mod schema;
pub mod split;
pub mod trace;
