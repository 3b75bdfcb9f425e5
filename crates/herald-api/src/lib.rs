//! Herald administrative HTTP API and configuration.
//!
//! Exposes the delivery manager's query and retry operations as JSON
//! endpoints, accepts producer submissions, and loads service
//! configuration with figment.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

use std::path::PathBuf;

use herald_delivery::DeliveryManager;

pub use config::Config;
pub use server::{create_router, shutdown_signal, start_server};

/// State shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Delivery manager driving all pending events.
    pub manager: DeliveryManager,
    /// Directory submitted attachments must resolve under. `None` rejects
    /// attachments.
    pub attachment_dir: Option<PathBuf>,
}

impl AppState {
    /// Wraps a running manager with attachments disabled.
    pub fn new(manager: DeliveryManager) -> Self {
        Self { manager, attachment_dir: None }
    }

    /// Accepts attachments located under `dir`.
    #[must_use]
    pub fn with_attachment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.attachment_dir = Some(dir.into());
        self
    }
}
