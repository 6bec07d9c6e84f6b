//! runnerpool controller library.
//!
//! This crate primarily ships a `runner-controller` binary, but we expose a
//! small library surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod lifecycle;
pub mod reconciler;
pub mod registration;
pub mod registry;
pub mod state;
pub mod template;
pub mod token;
