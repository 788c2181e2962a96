pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{RecordingProgress, annotated_blob, export_input, seeded_bytes, settings};
#[allow(unused_imports)]
pub use mocks::{Call, Fault, RecordingStore};
