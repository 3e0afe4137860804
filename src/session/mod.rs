//! Sessions: loading a model and running generations against it
//!
//! A session serializes generation requests. The native run call blocks and
//! polls a callback for every partial output; that callback is the only place
//! cancellation can be observed, so cancellation is cooperative and takes
//! effect at the next partial.

pub mod config;
pub mod controller;
pub mod io;
pub mod stream;

pub use config::{
    AsyncBatchSize, ContextLength, ContextMode, GrammarConfig, PrefillStepSize, Preset, RunConfig,
    SamplingMethod, SamplingPolicy, SamplingSeed, SessionConfig,
};
pub use controller::{Session, SessionPhase, SessionStats};
pub use io::{FinishReason, Input, Message, Output, OutputStats, ParsedText, Role};
pub use stream::{GenerationEvent, GenerationStream};
