use core::fmt;

/// Errors returned by the Channel Sounding core and the handover serializer.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A required input was absent or had the wrong size.
    InvalidArgument,

    /// The connection handle does not refer to an active connection.
    InvalidConnection,

    /// No Channel Sounding procedure is enabled for the requested configuration.
    NoProcedure,

    /// A caller-provided buffer is smaller than required.
    InsufficientMemory,

    /// A serialized block is truncated or declares a size that does not match its contents.
    InvalidMemorySize,

    /// A value lies outside of its permitted range.
    InvalidRange,

    /// A resource (connection slot, PSM, channel) could not be allocated.
    AllocationError,

    /// The size of a handover snapshot cannot be computed for this connection.
    InvalidDataSize,

    /// Generic failure of a multi-step operation.
    Failure,

    /// Channel Sounding security has not been started, so there is no DRBG to draw from.
    InsufficientSecurity,

    /// A feature required by the request is not supported by this controller or the peer.
    UnsupportedFeature,

    /// The command is not allowed in the current state.
    CommandDisallowed,

    /// The configuration ID is out of range.
    InvalidConfigId,

    /// The step mode is not valid in this context.
    InvalidStepMode,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    Eof,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidArgument => "invalid or missing argument",
            Error::InvalidConnection => "unknown connection",
            Error::NoProcedure => "no procedure enabled",
            Error::InsufficientMemory => "buffer too small",
            Error::InvalidMemorySize => "block size mismatch",
            Error::InvalidRange => "value out of range",
            Error::AllocationError => "allocation failed",
            Error::InvalidDataSize => "snapshot size unavailable",
            Error::Failure => "operation failed",
            Error::InsufficientSecurity => "channel sounding security not started",
            Error::UnsupportedFeature => "unsupported feature",
            Error::CommandDisallowed => "command disallowed",
            Error::InvalidConfigId => "invalid configuration id",
            Error::InvalidStepMode => "invalid step mode",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
        })
    }
}
