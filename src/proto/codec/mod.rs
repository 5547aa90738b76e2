//! The boundary between typed frames and the byte stream.

mod framed_read;
mod framed_write;

pub(crate) use self::framed_read::{FramedRead, ReadError};
pub(crate) use self::framed_write::{FramedWrite, PREFACE};
