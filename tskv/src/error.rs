use std::path::PathBuf;

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("IO error on '{}': {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Reached end of file '{}'", path.display()))]
    Eof { path: PathBuf },

    #[snafu(display("Checksum mismatch in '{}' at offset {}", path.display(), offset))]
    CrcMismatch { path: PathBuf, offset: u64 },

    #[snafu(display("Invalid block framing in '{}' at offset {}", path.display(), offset))]
    InvalidBlock { path: PathBuf, offset: u64 },

    #[snafu(display("Compaction log '{}' is corrupt: {}", path.display(), reason))]
    CompactionLogCorrupt { path: PathBuf, reason: String },

    #[snafu(display("Modification file '{}' is corrupt: {}", path.display(), reason))]
    ModsCorrupt { path: PathBuf, reason: String },

    #[snafu(display("TsFile resource not found for '{}'", path.display()))]
    ResourceNotFound { path: PathBuf },

    #[snafu(display("Compaction on {} cancelled", storage_group))]
    Cancelled { storage_group: String },
}
