#![allow(dead_code)]

use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("use of closed engine")]
    ErrEngineClosed,
    #[error("insufficient data in buffer")]
    ErrShortBuffer,
    #[error("bad label length octet")]
    ErrBadLabelLength,
    #[error("circular compression pointer")]
    ErrCircularPointer,
    #[error("invalid modified-utf8 sequence")]
    ErrInvalidUtf,
    #[error("message buffer full")]
    ErrBufferFull,
    #[error("message section out of order")]
    ErrSectionOutOfOrder,
    #[error("questions must precede answers")]
    ErrQuestionAfterAnswer,
    #[error("service type must end with '.'")]
    ErrServiceTypeSuffix,
    #[error("text property exceeds 255 bytes")]
    ErrPropertyTooLong,
    #[error("service is not registered")]
    ErrServiceNotRegistered,

    #[error("{0}")]
    Io(#[source] IoError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
