use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("seek position {0} past capacity {1}")]
    OutOfRange(u64, u64),
    #[error("read of {wanted} bytes exceeds readable size {readable}")]
    ShortBuffer { wanted: u64, readable: u64 },
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("varint exceeds {0} bits")]
    VarintOverflow(u32),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
}
