use std::{
    io::{self, Read, Write},
    pin::Pin,
    task::{Context, Poll},
    thread,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    sync::mpsc,
};
use tracing::debug;

use crate::terminal::Terminal;

const KEYBOARD_CHUNK: usize = 256;

const DELETE: u8 = 0x7f;
const BACKSPACE: u8 = 0x08;
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Char(char),
    Delete,
    Enter,
    Interrupt,
    Ignored,
}

/// Line editing over raw keystrokes, echoing through the shared terminal.
pub struct InputEditor<R, W> {
    reader: R,
    terminal: Terminal<W>,
    buffer: String,
}

impl<R, W> InputEditor<R, W>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    pub fn new(reader: R, terminal: Terminal<W>) -> Self {
        Self {
            reader,
            terminal,
            buffer: String::new(),
        }
    }

    /// The line being typed.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Collects keystrokes until a line terminator and returns the line
    /// without it.
    ///
    /// `Ok(None)` means input is over: stdin closed, or Ctrl-C / Ctrl-D.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let key = match self.next_key().await? {
                Some(key) => key,
                None => {
                    self.buffer.clear();
                    return Ok(None);
                }
            };

            match key {
                Key::Char(ch) => {
                    self.buffer.push(ch);
                    self.terminal.echo(ch)?;
                }
                Key::Delete => {
                    if self.buffer.pop().is_some() {
                        self.terminal.erase_last_char()?;
                    }
                }
                Key::Enter => {
                    self.terminal.clear_input_line()?;
                    return Ok(Some(std::mem::take(&mut self.buffer)));
                }
                Key::Interrupt => {
                    self.buffer.clear();
                    return Ok(None);
                }
                Key::Ignored => {}
            }
        }
    }

    async fn next_key(&mut self) -> io::Result<Option<Key>> {
        let lead = match self.next_byte().await? {
            Some(byte) => byte,
            None => return Ok(None),
        };

        let key = match lead {
            b'\n' | b'\r' => Key::Enter,
            DELETE | BACKSPACE => Key::Delete,
            CTRL_C | CTRL_D => Key::Interrupt,
            byte if byte.is_ascii_control() => Key::Ignored,
            byte if byte.is_ascii() => Key::Char(char::from(byte)),
            byte => match utf8_width(byte) {
                Some(width) => self.finish_char(byte, width).await?,
                None => Key::Ignored,
            },
        };
        Ok(Some(key))
    }

    async fn finish_char(&mut self, lead: u8, width: usize) -> io::Result<Key> {
        let mut bytes = [lead, 0, 0, 0];
        for slot in bytes.iter_mut().take(width).skip(1) {
            match self.next_byte().await? {
                Some(byte) => *slot = byte,
                None => return Ok(Key::Ignored),
            }
        }

        Ok(std::str::from_utf8(&bytes[..width])
            .ok()
            .and_then(|text| text.chars().next())
            .map_or(Key::Ignored, Key::Char))
    }

    async fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte).await? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }
}

fn utf8_width(lead: u8) -> Option<usize> {
    match lead {
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}

/// Raw keystrokes read on a detached thread and handed over a channel.
///
/// A blocking read of the terminal cannot be cancelled. Running it on its
/// own thread keeps it out of the runtime, so dropping the reader never
/// waits for the next keypress.
pub struct Keyboard {
    chunks: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl Keyboard {
    pub fn stdin() -> io::Result<Self> {
        Self::spawn(io::stdin())
    }

    pub fn spawn<S>(mut source: S) -> io::Result<Self>
    where
        S: Read + Send + 'static,
    {
        let (tx, chunks) = mpsc::channel(16);
        thread::Builder::new()
            .name("keyboard".into())
            .spawn(move || {
                let mut buf = [0u8; KEYBOARD_CHUNK];
                loop {
                    match source.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            debug!(error = ?err, "keyboard read failed");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            chunks,
            pending: Vec::new(),
            offset: 0,
        })
    }
}

impl AsyncRead for Keyboard {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset == this.pending.len() {
            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                // Reader thread gone: end of input.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let available = &this.pending[this.offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}
