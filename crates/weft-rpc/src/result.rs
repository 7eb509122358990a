use weft_codec::{CodecError, Decode, Encode, Serializer};

/// Status codes visible at RPC call sites, `u16` on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RpcCode {
    Success = 0,
    Fail,
    ArgsNotMatch,
    NoMethod,
    Closed,
    Timeout,
}

impl RpcCode {
    fn from_u16(v: u16) -> Self {
        match v {
            0 => Self::Success,
            2 => Self::ArgsNotMatch,
            3 => Self::NoMethod,
            4 => Self::Closed,
            5 => Self::Timeout,
            _ => Self::Fail,
        }
    }
}

/// Outcome of a call: status code, human message, and the value when the
/// code is `Success`. On the wire: code, message, then the value iff
/// successful.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResult<T> {
    pub code: RpcCode,
    pub msg: String,
    pub val: Option<T>,
}

impl<T> RpcResult<T> {
    pub fn success(val: T) -> Self {
        Self { code: RpcCode::Success, msg: "success".into(), val: Some(val) }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self::status(RpcCode::Fail, msg)
    }

    pub fn args_not_match(msg: impl Into<String>) -> Self {
        Self::status(RpcCode::ArgsNotMatch, msg)
    }

    pub fn no_method(msg: impl Into<String>) -> Self {
        Self::status(RpcCode::NoMethod, msg)
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::status(RpcCode::Closed, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::status(RpcCode::Timeout, msg)
    }

    pub fn status(code: RpcCode, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), val: None }
    }

    pub fn is_success(&self) -> bool {
        self.code == RpcCode::Success
    }

    pub fn into_val(self) -> Option<T> {
        self.val
    }
}

impl<T: Encode> Encode for RpcResult<T> {
    fn encode(&self, s: &mut Serializer) {
        s.write(&(self.code as u16));
        s.write(&self.msg);
        if self.code == RpcCode::Success
            && let Some(v) = &self.val
        {
            s.write(v);
        }
    }
}

impl<T: Decode> Decode for RpcResult<T> {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        let code = RpcCode::from_u16(s.read::<u16>()?);
        let msg = s.read::<String>()?;
        let val = if code == RpcCode::Success { Some(s.read::<T>()?) } else { None };
        Ok(Self { code, msg, val })
    }
}
