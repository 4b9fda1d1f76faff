//! Save/restore encoding for peripheral register state.
//!
//! Each device writes a header (format version, four-byte device id, device version) followed
//! by tag-length-value fields. Fields are emitted in ascending tag order so equal state always
//! encodes to equal bytes, and readers skip tags they do not know.

mod version;

pub use version::{
    codec, SnapshotError, SnapshotHeader, SnapshotReader, SnapshotResult, SnapshotVersion,
    SnapshotWriter,
};

/// A peripheral whose guest-visible state can be saved and restored.
///
/// `DEVICE_ID` never changes once published. Within one major `DEVICE_VERSION`, new state may
/// only be added as new tags.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}
