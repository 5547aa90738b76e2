//! Typed HTTP/2 frames and their wire representations.
//!
//! Each frame type knows how to `load` itself from a parsed [`Head`] plus
//! payload and how to `encode` itself into a buffer. Continuation
//! assembly and HPACK processing happen one layer up, in the codec.

mod data;
mod go_away;
mod head;
mod headers;
mod ping;
mod priority;
mod reason;
mod reset;
pub mod settings;
mod stream_id;
mod window_update;

pub use self::data::Data;
pub use self::go_away::GoAway;
pub use self::head::{Head, Kind};
pub use self::headers::{Headers, Pseudo, PushPromise};
pub use self::ping::Ping;
pub use self::priority::Priority;
pub use self::reason::Reason;
pub use self::reset::Reset;
pub use self::settings::Settings;
pub use self::stream_id::StreamId;
pub use self::window_update::WindowUpdate;

pub use self::head::{ACK, END_HEADERS, END_STREAM, PADDED, PRIORITY};

pub use self::settings::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_INITIAL_WINDOW_SIZE,
};

/// The length of the fixed frame header.
pub const HEADER_LEN: usize = 9;

/// A fully decoded frame.
#[derive(Debug)]
pub enum Frame {
    Data(Data),
    Headers(Headers),
    Priority(Priority),
    Reset(Reset),
    Settings(Settings),
    PushPromise(PushPromise),
    Ping(Ping),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
}

macro_rules! frame_from {
    ($($kind:ident),*) => {
        $(
            impl From<$kind> for Frame {
                fn from(src: $kind) -> Frame {
                    Frame::$kind(src)
                }
            }
        )*
    };
}

frame_from!(
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate
);

/// Errors raised while parsing a frame. All of them are fatal to the
/// connection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// A frame header shorter than nine octets.
    Short,

    /// A payload length other than the one the frame type requires.
    BadFrameSize,

    /// A payload longer than our advertised SETTINGS_MAX_FRAME_SIZE.
    OversizedPayload,

    /// The padding length exceeded the frame payload.
    TooMuchPadding,

    /// The payload was too short for the flags set on the frame.
    PayloadLengthTooShort,

    /// A SETTINGS payload that is not a round multiple of six octets.
    PartialSettingLength,

    /// A SETTINGS frame carrying both the ACK flag and a payload.
    InvalidPayloadAckSettings,

    /// A defined setting carrying a value outside its legal range.
    InvalidSettingValue,

    /// A connection-scoped frame with a stream id, or the reverse.
    InvalidStreamId,

    /// A PRIORITY frame declaring a stream dependent on itself.
    InvalidDependencyId,

    /// A CONTINUATION frame that does not continue the preceding header
    /// block, or a non-CONTINUATION frame arriving mid-block.
    UnexpectedContinuation,

    /// A header block violating the pseudo-header or field rules.
    MalformedHeaderBlock(&'static str),

    /// Failed to decode the HPACK header block fragment.
    Hpack(crate::proto::hpack::DecoderError),
}

impl From<crate::proto::hpack::DecoderError> for Error {
    fn from(src: crate::proto::hpack::DecoderError) -> Error {
        Error::Hpack(src)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Short => f.write_str("frame shorter than its header"),
            Error::BadFrameSize => f.write_str("frame with invalid payload length"),
            Error::OversizedPayload => f.write_str("frame exceeds maximum frame size"),
            Error::TooMuchPadding => f.write_str("padding exceeds the frame payload"),
            Error::PayloadLengthTooShort => f.write_str("payload too short for frame flags"),
            Error::PartialSettingLength => f.write_str("partial SETTINGS entry"),
            Error::InvalidPayloadAckSettings => f.write_str("SETTINGS ACK with a payload"),
            Error::InvalidSettingValue => f.write_str("setting value out of range"),
            Error::InvalidStreamId => f.write_str("invalid stream id for frame type"),
            Error::InvalidDependencyId => f.write_str("stream depends on itself"),
            Error::UnexpectedContinuation => f.write_str("unexpected CONTINUATION frame"),
            Error::MalformedHeaderBlock(detail) => {
                write!(f, "malformed header block: {detail}")
            }
            Error::Hpack(err) => write!(f, "hpack decoding failed: {err:?}"),
        }
    }
}

impl std::error::Error for Error {}
