//! Domain types for the recording engine.
//!
//! Schedules and retention settings arrive from the CRUD layer as loosely
//! validated rows; everything in this module is validated at the boundary so
//! the engine only ever sees well-formed values.

pub mod recording;
pub mod schedule;

pub use recording::{RecordingKey, RecordingOutput};
pub use schedule::{DaySet, RecordingMode, Schedule, TimeOfDay};
