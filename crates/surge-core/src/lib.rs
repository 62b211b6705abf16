//! Streaming bench core: frame decoding, record classification, per-run
//! aggregation, and the sequential concurrency ramp.

pub mod aggregate;
pub mod frame;
pub mod ramp;
pub mod record;

pub use aggregate::{RunAggregator, RunResult};
pub use frame::FrameDecoder;
pub use ramp::{RampConfig, RampController, RampEvent, RampPhase};
pub use record::{classify, Record};
