//! Processing stages placed below a source
//!
//! - **Filter**: per-channel high-pass, low-pass and notch
//! - **Reference**: re-referencing against the average of reference channels
//! - **TriggerDetector**: trigger and button markers from the trigger word
//! - **Storage**: recording to disk

pub mod filter;
pub mod reference;
pub mod storage;
pub mod trigger;

pub use filter::{Filter, FilterConfig};
pub use reference::{Reference, ReferenceSettings};
pub use storage::{START_SAVING, STOP_SAVING, Storage, StorageSettings};
pub use trigger::{BUTTON_COMMAND, TriggerDetector, TriggerSettings};
