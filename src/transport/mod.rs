//! The remote side of a backfill.
//!
//! The engine never talks to the network directly. It resolves a
//! conversation once, opens one [`Session`] per worker, and pages through ID
//! ranges with [`Session::fetch_page`].

mod http;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ConversationSpan, IdRange, MessageRecord};

pub use http::HttpTransport;
pub use memory::{MemoryTransport, MemoryTransportCounters};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying: timeouts, throttling, 5xx, dropped connections.
    #[error("transient transport failure: {0}")]
    Retryable(String),
    /// The session cannot recover; the run must stop.
    #[error("session unusable: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }
}

#[async_trait]
pub trait Session: Send + 'static {
    /// Return up to `limit` records with `range.start <= id < before_id`,
    /// newest first.
    async fn fetch_page(
        &mut self,
        range: IdRange,
        before_id: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    async fn resolve(&self, entity: &str) -> Result<ConversationSpan, TransportError>;

    /// Open an independent session. Sessions never share connection state.
    async fn open_session(&self, index: usize) -> Result<Self::Session, TransportError>;
}
