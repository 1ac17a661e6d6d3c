pub mod engine;
pub mod error;
pub mod feed;
pub mod playback;
pub mod spectrum;
pub mod store;
pub mod transport;
pub mod tuner;

#[cfg(test)]
mod testing;

pub use engine::{ControlCommand, CoreEvent, TunerCore, TunerView};
pub use error::{FeedError, PlaybackError};
pub use playback::{AudioOutput, FailureHook, PlayOutcome};
pub use spectrum::{SilentTap, SpectrumTap};
pub use transport::{HttpTransport, RemoteTransport};
