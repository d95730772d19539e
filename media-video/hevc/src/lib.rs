//! Hardware HEVC encoder frame orchestration
//!
//! Drives a fixed function HEVC encode engine (motion estimation, BRC kernels and the PAK) through
//! the multi pass encode of every frame. See [`encoder::EncodeOrchestrator`].

mod bitstream;
pub mod encoder;

pub use encoder::{EncodeError, EncodeOrchestrator, EncoderSettings};
