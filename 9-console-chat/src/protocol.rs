use std::{fmt, io};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// First token a client must send after connecting.
pub const CONNECT: &str = "CONNECT";

/// Appended to the client's own message stream when the server hangs up.
pub const SERVER_CLOSED: &str = "Server closed connection.";

pub fn connect_line(username: &str) -> String {
    format!("{CONNECT} {username}\n")
}

pub fn welcome(online: usize) -> String {
    format!("Welcome! {online} user(s) online\n")
}

pub fn joined(username: &str) -> String {
    format!("{username} joined!!!!\n")
}

/// `line` is forwarded as received, including its own terminator.
pub fn chat(username: &str, line: &str) -> String {
    if line.ends_with('\n') {
        format!("{username}: {line}")
    } else {
        format!("{username}: {line}\n")
    }
}

pub fn left(username: &str) -> String {
    format!("{username} left the chat\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The peer hung up before sending anything.
    Closed,
    /// No `<command> <username>` shape.
    Malformed(String),
    UnknownCommand(String),
    EmptyUsername,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Closed => write!(f, "connection closed before handshake"),
            HandshakeError::Malformed(line) => write!(f, "malformed handshake line {line:?}"),
            HandshakeError::UnknownCommand(command) => {
                write!(f, "expected {CONNECT}, got {command:?}")
            }
            HandshakeError::EmptyUsername => write!(f, "username cannot be empty"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Parses `CONNECT <username>` and returns the username.
pub fn parse_handshake(line: &str) -> Result<String, HandshakeError> {
    let trimmed = line.trim_end_matches(LINE_ENDINGS);
    let (command, username) = trimmed
        .split_once(' ')
        .ok_or_else(|| HandshakeError::Malformed(trimmed.to_string()))?;

    if command != CONNECT {
        return Err(HandshakeError::UnknownCommand(command.to_string()));
    }
    if username.is_empty() {
        return Err(HandshakeError::EmptyUsername);
    }
    if username.chars().any(char::is_whitespace) {
        return Err(HandshakeError::Malformed(trimmed.to_string()));
    }

    Ok(username.to_string())
}

/// Newline-delimited text over one connection.
///
/// The two halves are split apart on the server: the session keeps the
/// reader while the registry shares the writer with every broadcast.
pub struct LineChannel<R, W> {
    pub reader: LineReader<R>,
    pub writer: LineWriter<W>,
}

impl LineChannel<BufReader<OwnedReadHalf>, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(BufReader::new(reader), writer)
    }
}

impl<R, W> LineChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: LineReader::new(reader),
            writer: LineWriter::new(writer),
        }
    }

    pub fn into_split(self) -> (LineReader<R>, LineWriter<W>) {
        (self.reader, self.writer)
    }
}

pub struct LineReader<R> {
    inner: R,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Reads the next line with its terminator left in place.
    ///
    /// `Ok(None)` means the peer closed the stream. A final line without a
    /// terminator is returned as-is.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let bytes = self.inner.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

pub struct LineWriter<W> {
    inner: W,
    closed: bool,
}

impl<W> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Writes `text`, adding a `\n` if it does not already end with one, and
    /// flushes so peers see it immediately.
    pub async fn write_line(&mut self, text: &str) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "line channel already closed",
            ));
        }

        self.inner.write_all(text.as_bytes()).await?;
        if !text.ends_with('\n') {
            self.inner.write_all(b"\n").await?;
        }
        self.inner.flush().await
    }

    /// Shuts the write half down. Calling it again is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.shutdown().await
    }
}
