use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("buffer too short")]
    TooShort,
    #[error("invalid broadcast flag {0}")]
    BadBroadcastFlag(u8),
    #[error("frame too large: {0} bytes (max {max})", max = crate::constants::MAX_FRAME_LEN)]
    FrameTooLarge(usize),
    #[error("postcard decode error: {0}")]
    Postcard(#[from] postcard::Error),
}
