//! Connection provider abstraction.
//!
//! Sessions never talk to a pool directly. They go through the
//! [`ConnectionProvider`] trait, which hands out connections, takes them back,
//! and classifies transport failures. The pooled implementation lives in
//! [`crate::transport::pool`]; tests substitute mocks.

use crate::error::XccError;
use crate::transport::channel::ServerConnection;
use async_trait::async_trait;
use std::time::Instant;

/// What a caller should do after a connection failed mid-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// The connection was stale; obtaining a fresh one and resending is safe
    Retry,
    /// Report the error
    Fail,
}

/// Source of server connections for one address.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// `host:port` this provider connects to.
    fn address(&self) -> String;

    /// Whether connections are TLS-wrapped.
    fn is_secure(&self) -> bool;

    /// Hand out an idle connection or establish a new one.
    ///
    /// # Errors
    ///
    /// Returns a connection error if a new connection cannot be established.
    async fn obtain_connection(&self) -> Result<ServerConnection, XccError>;

    /// Give back a connection after a complete response was read.
    fn return_connection(&self, conn: ServerConnection);

    /// Give back a connection that failed and decide whether to retry.
    fn return_error_connection(&self, conn: ServerConnection, cause: &XccError) -> ErrorDisposition;

    /// Close idle connections whose lifetime ended at or before `now`.
    fn close_expired(&self, now: Instant) -> usize;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        pub Provider {}

        #[async_trait]
        impl ConnectionProvider for Provider {
            fn address(&self) -> String;
            fn is_secure(&self) -> bool;
            async fn obtain_connection(&self) -> Result<ServerConnection, XccError>;
            fn return_connection(&self, conn: ServerConnection);
            fn return_error_connection(&self, conn: ServerConnection, cause: &XccError) -> ErrorDisposition;
            fn close_expired(&self, now: Instant) -> usize;
        }
    }
}
