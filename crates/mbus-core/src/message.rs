//! Message framing: commands, payload, header
//!
//! A message is one header line followed by zero or more command lines:
//!
//! ```text
//! mbus/1.0 17 1714725600000 R (app:a id:1-0@10.0.0.1 ) (app:b ) (4 5 )
//! audio.play("intro" 2 )
//! audio.gain(0.500000 )
//! ```

use std::fmt;
use std::str::FromStr;

use crate::address::Address;
use crate::time::now_millis;
use crate::value::{parse_value, skip_blank, Symbol, Value};
use crate::{Error, Result};

/// Protocol version tag carried by every header
pub const PROTOCOL_VERSION: &str = "mbus/1.0";

/// Prefix of the built-in management commands
pub const MANAGEMENT_PREFIX: &str = "mbus.";

/// Periodic self-announcement command
pub const HELLO_COMMAND: &str = "mbus.hello";

/// Departure announcement command
pub const BYE_COMMAND: &str = "mbus.bye";

/// Delivery mode of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryType {
    #[default]
    Unreliable,
    Reliable,
}

impl DeliveryType {
    fn wire_char(self) -> char {
        match self {
            DeliveryType::Unreliable => 'U',
            DeliveryType::Reliable => 'R',
        }
    }

    fn from_wire_char(c: u8) -> Option<Self> {
        match c {
            b'U' => Some(DeliveryType::Unreliable),
            b'R' => Some(DeliveryType::Reliable),
            _ => None,
        }
    }
}

/// A named command with a list of arguments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Command {
    name: String,
    args: Vec<Value>,
}

impl Command {
    /// Create a command without arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Create a command with arguments
    pub fn with_args(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Parse one command line; the whole input must be consumed
    pub fn parse(text: &str) -> Result<Self> {
        let (cmd, used) = Self::parse_prefix(text)?;
        if !text[used..].trim().is_empty() {
            return Err(Error::Parse(format!(
                "trailing characters after command: {:?}",
                &text[used..]
            )));
        }
        Ok(cmd)
    }

    /// Parse a command from the front of `text`: the name is the maximal
    /// prefix of valid symbol characters, the remainder a single list.
    pub(crate) fn parse_prefix(text: &str) -> Result<(Self, usize)> {
        let mut name_end = 0;
        for c in text.chars() {
            if Symbol::is_valid_char(c) {
                name_end += c.len_utf8();
            } else {
                break;
            }
        }
        let name = text[..name_end].to_string();

        let (args, used) = parse_value(&text[name_end..])?;
        match args {
            Value::List(args) => Ok((Self { name, args }, name_end + used)),
            _ => Err(Error::Parse(format!(
                "command {:?} arguments are not a list",
                name
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Append an argument
    pub fn push_arg(&mut self, arg: impl Into<Value>) {
        self.args.push(arg.into());
    }

    /// Check the command name
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for arg in &self.args {
            write!(f, "{} ", arg)?;
        }
        write!(f, ")")
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Command::parse(s)
    }
}

/// The ordered command sequence of a message.
///
/// Order is significant: the first command's name decides whether the
/// message is a built-in control message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    commands: Vec<Command>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse command lines until the end of the buffer. An empty buffer
    /// is an empty payload, not an error.
    pub fn parse(text: &str) -> Result<Self> {
        let mut commands = Vec::new();
        for line in text.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            // anything after the command on the same line is ignored
            let (cmd, _) = Command::parse_prefix(line)?;
            commands.push(cmd);
        }
        Ok(Self { commands })
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn first(&self) -> Option<&Command> {
        self.commands.first()
    }

    pub fn get(&self, index: usize) -> Option<&Command> {
        self.commands.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for command in &self.commands {
            writeln!(f, "{}", command)?;
        }
        Ok(())
    }
}

/// The transport header of a message.
///
/// Formatting stamps the timestamp from wall-clock time; the parsed-in
/// value is not preserved across a write/read cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    pub delivery: DeliveryType,
    pub sequence_no: u64,
    pub timestamp: u64,
    pub source: Address,
    pub destination: Address,
    pub acks: Vec<u64>,
}

impl Header {
    /// Parse a header from the front of `text`, returning the bytes
    /// consumed
    pub(crate) fn parse_prefix(text: &str) -> Result<(Self, usize)> {
        let bytes = text.as_bytes();
        let mut pos = skip_blank(bytes, 0);

        if !text[pos..].starts_with(PROTOCOL_VERSION) {
            let tag: String = text[pos..].chars().take(16).collect();
            return Err(Error::VersionMismatch(tag));
        }
        pos += PROTOCOL_VERSION.len();

        let (sequence_no, next) = parse_u64_field(text, pos)?;
        let (timestamp, next) = parse_u64_field(text, next)?;

        pos = skip_blank(bytes, next);
        if pos >= bytes.len() {
            return Err(Error::Parse("header truncated before type".to_string()));
        }
        let delivery = DeliveryType::from_wire_char(bytes[pos])
            .ok_or_else(|| Error::Parse(format!("invalid delivery type {:?}", bytes[pos] as char)))?;
        pos += 1;

        let (source, used) = Address::parse_prefix(&text[pos..])?;
        pos += used;
        let (destination, used) = Address::parse_prefix(&text[pos..])?;
        pos += used;

        pos = skip_blank(bytes, pos);
        if pos >= bytes.len() || bytes[pos] != b'(' {
            return Err(Error::Parse("expected acknowledgement list".to_string()));
        }
        pos += 1;
        let mut acks = Vec::new();
        loop {
            pos = skip_blank(bytes, pos);
            if pos >= bytes.len() {
                return Err(Error::Parse(
                    "unterminated acknowledgement list".to_string(),
                ));
            }
            if bytes[pos] == b')' {
                pos += 1;
                break;
            }
            let (ack, next) = parse_u64_field(text, pos)?;
            acks.push(ack);
            pos = next;
        }

        Ok((
            Self {
                delivery,
                sequence_no,
                timestamp,
                source,
                destination,
                acks,
            },
            pos,
        ))
    }

    /// Parse a full header line
    pub fn parse(text: &str) -> Result<Self> {
        let (header, used) = Self::parse_prefix(text)?;
        if !text[used..].trim().is_empty() {
            return Err(Error::Parse(format!(
                "trailing characters after header: {:?}",
                &text[used..]
            )));
        }
        Ok(header)
    }
}

/// Read a whitespace-preceded decimal field; the digit run must be
/// terminated by further whitespace (or ')').
fn parse_u64_field(text: &str, pos: usize) -> Result<(u64, usize)> {
    let bytes = text.as_bytes();
    let start = skip_blank(bytes, pos);
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == start {
        return Err(Error::Parse("expected a number".to_string()));
    }
    if end < bytes.len() && !matches!(bytes[end], b' ' | b'\t' | b'\n' | b')') {
        return Err(Error::Parse(format!(
            "invalid character {:?} after number",
            bytes[end] as char
        )));
    }
    let value = text[start..end]
        .parse::<u64>()
        .map_err(|_| Error::Parse(format!("number {:?} out of range", &text[start..end])))?;
    Ok((value, end))
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} (",
            PROTOCOL_VERSION,
            self.sequence_no,
            now_millis(),
            self.delivery.wire_char(),
            self.source,
            self.destination,
        )?;
        for ack in &self.acks {
            write!(f, "{} ", ack)?;
        }
        write!(f, ")")
    }
}

/// The top-level transport unit: header plus payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message addressed to `destination`
    pub fn to(destination: Address) -> Self {
        let mut msg = Self::new();
        msg.header.destination = destination;
        msg
    }

    /// Mark the message for reliable delivery
    pub fn reliable(mut self) -> Self {
        self.header.delivery = DeliveryType::Reliable;
        self
    }

    /// Parse a serialized message: header line, `\n`, command lines
    pub fn parse(text: &str) -> Result<Self> {
        let (header, used) = Header::parse_prefix(text)?;
        let rest = &text[used..];
        let newline = rest
            .find('\n')
            .ok_or_else(|| Error::Parse("missing newline after header".to_string()))?;
        let payload = Payload::parse(&rest[newline + 1..])?;
        Ok(Self { header, payload })
    }

    /// Append a command
    pub fn add(&mut self, command: Command) {
        self.payload.push(command);
    }

    /// Append an argument-less command by name
    pub fn add_command(&mut self, name: &str) {
        self.payload.push(Command::new(name));
    }

    /// Check whether the first payload command has the given name
    pub fn contains(&self, name: &str) -> bool {
        self.payload.first().map(|c| c.is(name)).unwrap_or(false)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header)?;
        write!(f, "{}", self.payload)
    }
}

impl FromStr for Message {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Message::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let cmd = Command::with_args(
            "audio.play",
            vec![Value::from("intro"), Value::from(2)],
        );
        let text = cmd.to_string();
        assert_eq!(text, "audio.play(\"intro\" 2 )");
        assert_eq!(Command::parse(&text).unwrap(), cmd);
    }

    #[test]
    fn command_name_stops_at_invalid_char() {
        let cmd = Command::parse("mbus.hello ()").unwrap();
        assert_eq!(cmd.name(), "mbus.hello");
        assert!(cmd.args().is_empty());
    }

    #[test]
    fn payload_order_is_preserved() {
        let payload = Payload::parse("first()\nsecond(1 )\n").unwrap();
        assert_eq!(payload.len(), 2);
        assert!(payload.first().unwrap().is("first"));
    }

    #[test]
    fn header_round_trip() {
        let mut header = Header::default();
        header.delivery = DeliveryType::Reliable;
        header.sequence_no = 17;
        header.source = Address::parse("(app:a id:1-0@127.0.0.1)").unwrap();
        header.destination = Address::parse("(app:b)").unwrap();
        header.acks = vec![4, 5];

        let parsed = Header::parse(&header.to_string()).unwrap();
        assert_eq!(parsed.delivery, DeliveryType::Reliable);
        assert_eq!(parsed.sequence_no, 17);
        assert_eq!(parsed.source, header.source);
        assert_eq!(parsed.destination, header.destination);
        assert_eq!(parsed.acks, vec![4, 5]);
    }

    #[test]
    fn header_rejects_wrong_version() {
        assert!(matches!(
            Header::parse("xbus/1.0 0 0 U () () ()"),
            Err(Error::VersionMismatch(_))
        ));
    }

    #[test]
    fn message_with_empty_payload() {
        let mut msg = Message::new();
        msg.header.source = Address::parse("(app:a id:x)").unwrap();
        let text = msg.to_string();
        let parsed = Message::parse(&text).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn message_without_newline_fails() {
        let msg = Message::new();
        let text = msg.to_string();
        assert!(Message::parse(text.trim_end_matches('\n')).is_err());
    }

    #[test]
    fn contains_checks_first_command_only() {
        let mut msg = Message::new();
        msg.add_command("mbus.hello");
        msg.add_command("other");
        assert!(msg.contains(HELLO_COMMAND));
        assert!(!msg.contains("other"));
    }
}
