//! The decoded shape of a RESP reply (§4.2) plus the bulk-string numeric
//! conversion policy.

use crate::error::{ErrorKind, RedisError};

/// A fully-parsed reply. `Array` covers multi-bulk, including the nested
/// arrays produced by `EXEC` and `SENTINEL MASTERS`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `+OK\r\n` and other simple status strings.
    Status(String),
    /// `:123\r\n`
    Int(i64),
    /// `$-1\r\n` or an empty-string special case some callers care about.
    Nil,
    /// Raw bytes from a `$`-bulk that convert_numbers left untouched, or that
    /// failed to decode under the configured charset.
    Bytes(Vec<u8>),
    /// A bulk that decoded to text (and was not number-converted).
    Text(String),
    /// A bulk that convert_numbers recognized as an integer.
    Double(f64),
    /// `*N\r\n...`; `None` represents the null array (`*-1\r\n`).
    Array(Vec<Value>),
    /// A `-`-prefixed server error line (§4.2). Carried as a value rather
    /// than a `Decoder` error so that response-errors surface to the caller
    /// of the specific command without closing the connection (§7); only
    /// unparseable bytes are a fatal, connection-closing decode error.
    Error(RedisError),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Interprets the value as a UTF-8 string regardless of which bulk
    /// variant it decoded to, for callers that only care about the text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Status(s) | Value::Text(s) => Some(s.as_str()),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

/// Tokens that `convert_numbers` must never numerically convert (§4.2) even
/// though they are syntactically parseable as floats by some libraries.
const NON_NUMERIC_FLOAT_TOKENS: [&str; 3] = ["+inf", "-inf", "NaN"];

/// Applies the bulk decoding policy to a raw `$`-bulk payload: integers
/// without a `.` become `Int`, values with a `.` that parse as floats become
/// `Double`, and everything else is decoded as text (falling back to raw
/// bytes on decode failure). `+inf`/`-inf`/`NaN` are carved out and always
/// returned as text, per the documented, testable property in §4.2/§8.
pub fn decode_bulk(raw: Vec<u8>, charset: Option<&'static encoding::Charset>, convert_numbers: bool) -> Value {
    if convert_numbers {
        if let Ok(s) = std::str::from_utf8(&raw) {
            if NON_NUMERIC_FLOAT_TOKENS.contains(&s) {
                return Value::Text(s.to_string());
            }
            if !s.contains('.') {
                if let Ok(i) = s.parse::<i64>() {
                    return Value::Int(i);
                }
            } else if let Ok(f) = s.parse::<f64>() {
                return Value::Double(f);
            }
        }
    }
    match charset {
        None => Value::Bytes(raw),
        Some(cs) => match cs.decode(&raw) {
            Ok(s) => Value::Text(s),
            Err(_) => Value::Bytes(raw),
        },
    }
}

/// Turns a server error line (without the leading `-`) into a `RedisError`
/// of the appropriate kind, per §4.2/§7.
pub fn error_from_line(line: &str) -> RedisError {
    RedisError::from_server_message(line)
}

pub fn invalid_response(detail: impl Into<String>) -> RedisError {
    RedisError::new(ErrorKind::InvalidResponse, detail.into())
}

/// Minimal charset abstraction: the only non-binary charset the spec
/// actually exercises is UTF-8 (§6, `charset` option), so this is a tiny
/// trait object rather than a dependency on a general encoding crate.
pub mod encoding {
    #[derive(Debug)]
    pub struct Charset {
        name: &'static str,
    }

    pub static UTF8: Charset = Charset { name: "utf-8" };

    impl Charset {
        pub fn name(&self) -> &'static str {
            self.name
        }

        pub fn decode(&self, bytes: &[u8]) -> Result<String, std::str::Utf8Error> {
            std::str::from_utf8(bytes).map(|s| s.to_string())
        }

        pub fn encode(&self, text: &str) -> Vec<u8> {
            text.as_bytes().to_vec()
        }
    }
}
