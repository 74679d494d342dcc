//! Context channel: an auxiliary per-timestep conditioning vector, either
//! passed through from upstream or produced by a learned window encoder
//! trained with its own auxiliary objectives.

pub mod encoder;
pub mod provider;

pub use encoder::{CrossModalConfig, CtxEncoder, CtxEncoderConfig, CtxWindow};
pub use provider::ContextProvider;
