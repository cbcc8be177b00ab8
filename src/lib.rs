//! Taskoo web - HTTP host for the taskoo core WebAssembly module
//!
//! This library loads the compiled task manager core, talks to it through its
//! exported allocator and string functions, and serves it over HTTP.

pub mod api;
pub mod bridge;
pub mod config;
