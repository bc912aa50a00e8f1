//! Error types for music parsing, conversion and playback

/// Error type for all fallible library operations
///
/// This enum covers the whole library. Codec reads surface [`Error::Io`] and
/// [`Error::InvalidData`]; codec writes surface [`Error::FormatLimitation`];
/// the converters surface [`Error::BadPatch`] and [`Error::ChannelMismatch`]
/// on the conversion path. During live playback nothing is propagated: bad
/// events are logged and dropped.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// IO error from the underlying stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A patch of the wrong kind was used, or an instrument index was out of
    /// range for the patch bank
    #[error("Bad patch: {0}")]
    BadPatch(String),

    /// The song cannot be represented in the requested file format
    ///
    /// The message is human readable and should be shown to the user, as it
    /// explains what must change for the conversion to succeed.
    #[error("Format limitation: {0}")]
    FormatLimitation(String),

    /// A rhythm instrument was played on a channel reserved for a different
    /// rhythm role
    #[error("Channel mismatch: {0}")]
    ChannelMismatch(String),

    /// File contents are inconsistent with the declared format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A user-supplied index exceeds the size of the collection
    #[error("Out of range: {0}")]
    OutOfRange(String),
}

impl From<String> for Error {
    /// Converts a String into `Error::InvalidData`.
    fn from(msg: String) -> Self {
        Error::InvalidData(msg)
    }
}

impl From<&str> for Error {
    /// Converts a string slice into `Error::InvalidData`.
    fn from(msg: &str) -> Self {
        Error::InvalidData(msg.to_string())
    }
}

/// Result type for library operations
pub type Result<T> = std::result::Result<T, Error>;
