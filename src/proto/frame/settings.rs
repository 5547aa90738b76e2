use bytes::{BufMut, BytesMut};

use super::{head, Error, Head, Kind, StreamId};

const HEADER_TABLE_SIZE: u16 = 1;
const ENABLE_PUSH: u16 = 2;
const MAX_CONCURRENT_STREAMS: u16 = 3;
const INITIAL_WINDOW_SIZE: u16 = 4;
const MAX_FRAME_SIZE: u16 = 5;
const MAX_HEADER_LIST_SIZE: u16 = 6;

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// A SETTINGS frame: configuration parameters that apply to the whole
/// connection. Unknown parameters are ignored for forward compatibility.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Settings {
    ack: bool,
    header_table_size: Option<u32>,
    enable_push: Option<u32>,
    max_concurrent_streams: Option<u32>,
    initial_window_size: Option<u32>,
    max_frame_size: Option<u32>,
    max_header_list_size: Option<u32>,
}

impl Settings {
    pub fn ack() -> Settings {
        Settings {
            ack: true,
            ..Settings::default()
        }
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn header_table_size(&self) -> Option<u32> {
        self.header_table_size
    }

    pub fn set_header_table_size(&mut self, size: Option<u32>) {
        self.header_table_size = size;
    }

    pub fn is_push_enabled(&self) -> Option<bool> {
        self.enable_push.map(|v| v == 1)
    }

    pub fn set_enable_push(&mut self, enable: bool) {
        self.enable_push = Some(enable as u32);
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    pub fn initial_window_size(&self) -> Option<u32> {
        self.initial_window_size
    }

    pub fn set_initial_window_size(&mut self, size: Option<u32>) {
        self.initial_window_size = size;
    }

    pub fn max_frame_size(&self) -> Option<u32> {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, size: Option<u32>) {
        if let Some(val) = size {
            debug_assert!((DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&val));
        }
        self.max_frame_size = size;
    }

    pub fn max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    pub fn set_max_header_list_size(&mut self, size: Option<u32>) {
        self.max_header_list_size = size;
    }

    /// Overlay the parameters present in `other` onto `self`. Parameters
    /// absent from `other` keep their current value, mirroring how each
    /// received SETTINGS frame updates only what it carries.
    pub fn merge(&mut self, other: &Settings) {
        macro_rules! merge {
            ($($field:ident),*) => {
                $(
                    if let Some(val) = other.$field {
                        self.$field = Some(val);
                    }
                )*
            };
        }
        merge!(
            header_table_size,
            enable_push,
            max_concurrent_streams,
            initial_window_size,
            max_frame_size,
            max_header_list_size
        );
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Settings, Error> {
        debug_assert_eq!(head.kind(), Kind::Settings);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if head.flag() & head::ACK != 0 {
            // Receivers of a SETTINGS frame with the ACK flag set and a
            // length field value other than 0 MUST treat it as a
            // connection error of type FRAME_SIZE_ERROR.
            return if payload.is_empty() {
                Ok(Settings::ack())
            } else {
                Err(Error::InvalidPayloadAckSettings)
            };
        }

        if payload.len() % 6 != 0 {
            return Err(Error::PartialSettingLength);
        }

        let mut settings = Settings::default();

        for chunk in payload.chunks(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);

            match id {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.enable_push = Some(value);
                }
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_INITIAL_WINDOW_SIZE {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                // An endpoint that receives a SETTINGS frame with any
                // unknown or unsupported identifier MUST ignore that
                // setting.
                _ => {}
            }
        }

        Ok(settings)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let payload_len = self.len_in_payload();
        let flags = if self.ack { head::ACK } else { 0 };
        let head = Head::new(Kind::Settings, flags, StreamId::ZERO);

        head.encode(payload_len, dst);

        self.for_each(|id, value| {
            dst.put_u16(id);
            dst.put_u32(value);
        });
    }

    fn len_in_payload(&self) -> usize {
        let mut count = 0;
        self.for_each(|_, _| count += 1);
        count * 6
    }

    fn for_each<F: FnMut(u16, u32)>(&self, mut f: F) {
        if self.ack {
            return;
        }
        if let Some(v) = self.header_table_size {
            f(HEADER_TABLE_SIZE, v);
        }
        if let Some(v) = self.enable_push {
            f(ENABLE_PUSH, v);
        }
        if let Some(v) = self.max_concurrent_streams {
            f(MAX_CONCURRENT_STREAMS, v);
        }
        if let Some(v) = self.initial_window_size {
            f(INITIAL_WINDOW_SIZE, v);
        }
        if let Some(v) = self.max_frame_size {
            f(MAX_FRAME_SIZE, v);
        }
        if let Some(v) = self.max_header_list_size {
            f(MAX_HEADER_LIST_SIZE, v);
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut builder = f.debug_struct("Settings");
        builder.field("ack", &self.ack);
        self.for_each(|id, value| {
            let name = match id {
                HEADER_TABLE_SIZE => "header_table_size",
                ENABLE_PUSH => "enable_push",
                MAX_CONCURRENT_STREAMS => "max_concurrent_streams",
                INITIAL_WINDOW_SIZE => "initial_window_size",
                MAX_FRAME_SIZE => "max_frame_size",
                MAX_HEADER_LIST_SIZE => "max_header_list_size",
                _ => "unknown",
            };
            builder.field(name, &value);
        });
        builder.finish()
    }
}
