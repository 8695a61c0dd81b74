//! Hardware acquisition: device boundary, counter continuity and down-sampling

pub mod amplifier;
pub mod continuity;
pub mod decimation;
pub mod device;

pub use amplifier::{Amplifier, AmplifierSettings};
pub use continuity::{ContinuityTracker, MissingSampleMonitor};
pub use decimation::{Decimated, Decimator};
pub use device::{HardwareDevice, RawFrames, SimulatedDevice, decode_frames, encode_frames};
