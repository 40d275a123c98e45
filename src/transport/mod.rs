//! Transport layer: pooled connections and HTTP framing.
//!
//! # Architecture
//!
//! The transport layer is organized into:
//! - `protocol` - the [`ConnectionProvider`] trait sessions talk to
//! - `pool` - keyed connection pools, the registry and its reaper
//! - `channel` - plain and TLS byte channels wrapped as [`ServerConnection`]
//! - `tls` - rustls client configuration
//! - `http` - request encoding and response framing
//! - `multipart` - incremental `multipart/mixed` reader
//!
//! # Example
//!
//! ```no_run
//! use xcc_rs::config::DriverConfig;
//! use xcc_rs::transport::{ConnectionProvider, ConnectionRegistry, PoolKey};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ConnectionRegistry::new(DriverConfig::default());
//! let pool = registry.pool(PoolKey::new("localhost", 8000, None))?;
//!
//! let conn = pool.obtain_connection().await?;
//! pool.return_connection(conn);
//! assert_eq!(pool.idle_count(), 1);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod http;
pub mod multipart;
pub mod pool;
pub mod protocol;
pub mod tls;

pub use channel::{ByteChannel, ChannelHealth, ServerConnection};
pub use pool::{ConnectionPool, ConnectionRegistry, PoolKey};
pub use protocol::{ConnectionProvider, ErrorDisposition};
pub use tls::SecurityOptions;
