//! Control plane for Docker-backed agent sandboxes and conversation event delivery.

pub mod auth;
pub mod callbacks;
pub mod cli;
pub mod config;
pub mod context;
pub mod conversations;
pub mod engine;
pub mod events;
pub mod pagination;
pub mod router;
pub mod sandbox;
pub mod store;
pub mod subscribers;
