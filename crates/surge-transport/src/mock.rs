//! Scriptable transport for exercising the ramp pipeline without a server.

use async_trait::async_trait;
use bytes::Bytes;
use surge_common::{Result, SurgeError};
use tokio_stream::StreamExt as _;

use crate::{ByteStream, StreamTransport};

/// What a scripted level does when started.
pub enum MockRun {
    /// Yield these chunks in order, then end the stream.
    Chunks(Vec<Vec<u8>>),
    /// Yield these chunks, then hang forever (timeout scenarios).
    ChunksThenHang(Vec<Vec<u8>>),
    /// Fail immediately before producing any bytes.
    Fail(String),
}

pub struct MockTransport {
    script: Box<dyn Fn(u32) -> MockRun + Send + Sync>,
}

impl MockTransport {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(u32) -> MockRun + Send + Sync + 'static,
    {
        Self { script: Box::new(script) }
    }

    /// Every level replays the same chunk sequence.
    pub fn replay(chunks: Vec<Vec<u8>>) -> Self {
        Self::new(move |_| MockRun::Chunks(chunks.clone()))
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn start_run(&self, level: u32, _message: &str, _model: &str) -> Result<ByteStream> {
        match (self.script)(level) {
            MockRun::Chunks(chunks) => {
                let items: Vec<Result<Bytes>> =
                    chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
                Ok(Box::pin(tokio_stream::iter(items)))
            }
            MockRun::ChunksThenHang(chunks) => {
                let items: Vec<Result<Bytes>> =
                    chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
                Ok(Box::pin(tokio_stream::iter(items).chain(tokio_stream::pending())))
            }
            MockRun::Fail(reason) => Err(SurgeError::Transport(reason)),
        }
    }
}
