//! Pluggable outbound channels for rendered messages.
//!
//! A messenger is any backend that can carry a [`Message`] to its
//! recipients: the SMTP pool in [`email`], the HTTP postback client in
//! [`postback`], or a test double. Backends are looked up by name through
//! the [`Registry`]; a campaign names exactly one backend.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod email;
pub mod error;
pub mod postback;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use courier_common::models::Message;

pub use error::{MessengerError, PermanentError, TransientError};

/// An outbound delivery backend.
#[async_trait]
pub trait Messenger: Send + Sync + Debug {
    /// Registry name this backend is addressed by.
    fn name(&self) -> &str;

    /// Deliver one message. Implementations classify their failures as
    /// permanent or transient; callers never see transport-level errors.
    async fn push(&self, message: &Message) -> error::Result<()>;

    /// Release any held resources. Called once at shutdown.
    async fn close(&self) -> error::Result<()> {
        Ok(())
    }
}

/// Name-to-backend map populated once at startup.
#[derive(Debug, Default)]
pub struct Registry {
    backends: ahash::AHashMap<String, Arc<dyn Messenger>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name.
    ///
    /// # Errors
    /// If a backend with the same name is already registered.
    pub fn register(&mut self, messenger: Arc<dyn Messenger>) -> error::Result<()> {
        let name = messenger.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(MessengerError::Permanent(PermanentError::Configuration(
                format!("messenger \"{name}\" is already registered"),
            )));
        }
        self.backends.insert(name, messenger);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Messenger>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    /// Close every registered backend, logging failures.
    pub async fn close_all(&self) {
        for (name, messenger) in &self.backends {
            if let Err(e) = messenger.close().await {
                tracing::warn!(messenger = %name, error = %e, "error closing messenger");
            }
        }
    }
}
