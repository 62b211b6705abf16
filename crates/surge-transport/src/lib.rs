//! Transport collaborator: turns one run request into a raw byte stream.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use surge_common::Result;
use tokio_stream::Stream;

pub mod http;

#[cfg(feature = "mock")]
pub mod mock;

pub use http::{Endpoint, HttpTransport};

/// Raw bytes in arrival order, until the peer closes the stream or an I/O
/// error surfaces.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// One streaming request per call. An implementation either yields a byte
/// stream or fails immediately; it never retries on its own.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn start_run(&self, level: u32, message: &str, model: &str) -> Result<ByteStream>;
}
