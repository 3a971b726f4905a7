//! RESP wire protocol: framing (C1), value decoding and command encoding
//! (C2).

pub mod cmd;
pub mod codec;
pub mod framer;
pub mod value;

pub use cmd::{Cmd, Pipeline};
pub use codec::RespCodec;
pub use value::Value;
