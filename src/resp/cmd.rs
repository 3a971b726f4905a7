//! Outbound command construction (§4.2 "Command encoding").
//!
//! A [`Cmd`] is a command name plus a list of already-encoded argument byte
//! strings; building one never fails, because the only encodable failure mode
//! described in §4.2 (an argument that cannot be represented in the
//! connection's charset) cannot occur while arguments are taken as `&str`/
//! `String`/`Vec<u8>`, all of which are already valid UTF-8 or explicit raw
//! bytes. A `Pipeline` is a sequence of commands packed back-to-back for a
//! single transport write (§4.6).

/// Commands that may legitimately block on the server for longer than the
/// configured reply timeout (§4.3) and so must not be subject to it.
const BLOCKING_COMMANDS: [&str; 3] = ["BLPOP", "BRPOP", "BRPOPLPUSH"];

/// A single RESP command, ready to be multi-bulk encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
}

impl Cmd {
    pub fn new(name: &str) -> Self {
        Cmd { args: vec![name.as_bytes().to_vec()] }
    }

    /// Appends a textual argument.
    pub fn arg(mut self, value: impl AsRef<str>) -> Self {
        self.args.push(value.as_ref().as_bytes().to_vec());
        self
    }

    /// Appends a raw byte-string argument (binary-safe values, §4.2).
    pub fn arg_bytes(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends an integer argument using Redis's canonical decimal form.
    pub fn arg_int(mut self, value: i64) -> Self {
        self.args.push(value.to_string().into_bytes());
        self
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.args[0]).expect("command names are ASCII")
    }

    /// Whether this command opts out of the reply timeout (§4.3).
    pub fn is_blocking(&self) -> bool {
        BLOCKING_COMMANDS.contains(&self.name())
    }

    pub fn packed_args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Upper bound on the encoded size, used to size the output buffer before
    /// the codec writes header lines and payloads.
    pub fn encoded_len_hint(&self) -> usize {
        let headers = 16 * (self.args.len() + 1);
        let payloads: usize = self.args.iter().map(|a| a.len() + 2).sum();
        headers + payloads
    }

    /// Fully RESP-encodes this command into a standalone byte string, for
    /// callers that want to pack several commands into one pipeline buffer
    /// (§4.6) ahead of a single transport write.
    pub fn packed_command(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len_hint());
        out.extend_from_slice(format!("*{}\r\n", self.args.len()).as_bytes());
        for arg in &self.args {
            out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

/// An ordered batch of commands sent together without waiting for
/// intervening replies (§4.6 explicit pipeline mode).
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Cmd>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    pub fn add(&mut self, cmd: Cmd) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Cmd] {
        &self.commands
    }

    /// Whether any buffered command is blocking (§4.3) — exempts the whole
    /// batch from the reply timeout.
    pub fn is_blocking(&self) -> bool {
        self.commands.iter().any(Cmd::is_blocking)
    }

    /// Concatenates every command's packed bytes for a single write.
    pub fn packed(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for cmd in &self.commands {
            out.extend(cmd.packed_command());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_simple_command() {
        let cmd = Cmd::new("GET").arg("key");
        assert_eq!(cmd.packed_command(), b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n".to_vec());
    }

    #[test]
    fn packs_mixed_argument_kinds() {
        let cmd = Cmd::new("SET").arg("key").arg_bytes(vec![0xff, 0x00]).arg_int(42);
        assert_eq!(
            cmd.packed_command(),
            b"*4\r\n$3\r\nSET\r\n$3\r\nkey\r\n$2\r\n\xff\x00\r\n$2\r\n42\r\n".to_vec()
        );
    }

    #[test]
    fn name_reports_command_verb() {
        assert_eq!(Cmd::new("PING").name(), "PING");
    }

    #[test]
    fn blocking_commands_are_flagged() {
        assert!(Cmd::new("BLPOP").arg("k").arg_int(0).is_blocking());
        assert!(!Cmd::new("GET").arg("k").is_blocking());
    }

    #[test]
    fn pipeline_is_blocking_if_any_command_is() {
        let mut pipeline = Pipeline::new();
        pipeline.add(Cmd::new("GET").arg("k"));
        assert!(!pipeline.is_blocking());
        pipeline.add(Cmd::new("BRPOP").arg("k").arg_int(0));
        assert!(pipeline.is_blocking());
    }

    #[test]
    fn pipeline_concatenates_packed_commands() {
        let mut pipeline = Pipeline::new();
        pipeline.add(Cmd::new("PING"));
        pipeline.add(Cmd::new("GET").arg("k"));
        let mut expected = Cmd::new("PING").packed_command();
        expected.extend(Cmd::new("GET").arg("k").packed_command());
        assert_eq!(pipeline.packed(), expected);
        assert_eq!(pipeline.len(), 2);
    }
}
