//! Cursor and line primitives for the chat screen.
//!
//! Every operation takes the same lock, writes its whole escape sequence and
//! flushes before releasing it. The input echo and the message redraw run on
//! different tasks, and without the lock their sequences would interleave.

use std::{
    io::{self, Stdout, Write},
    sync::{Arc, Mutex},
};

use crossterm::{
    cursor::{MoveLeft, MoveTo, MoveToColumn, RestorePosition, SavePosition},
    queue,
    style::Print,
    terminal::{self, Clear, ClearType},
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub struct Terminal<W> {
    out: Arc<Mutex<W>>,
}

impl<W> Clone for Terminal<W> {
    fn clone(&self) -> Self {
        Self {
            out: Arc::clone(&self.out),
        }
    }
}

impl Terminal<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W> Terminal<W>
where
    W: Write,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    fn with_output<F>(&self, draw: F) -> io::Result<()>
    where
        F: FnOnce(&mut W) -> io::Result<()>,
    {
        let mut out = self
            .out
            .lock()
            .map_err(|_| io::Error::other("terminal writer poisoned"))?;
        draw(&mut out)?;
        out.flush()
    }

    /// Clears the screen and parks the cursor on the input row.
    pub fn prepare_screen(&self, rows: u16) -> io::Result<()> {
        self.with_output(|out| {
            queue!(
                out,
                Clear(ClearType::All),
                MoveTo(0, rows.saturating_sub(1))
            )
        })
    }

    /// Repaints the message region from the top row, leaving the cursor
    /// where the user was typing.
    pub fn redraw<'a, I>(&self, lines: I) -> io::Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.with_output(|out| {
            queue!(out, SavePosition)?;
            for (row, line) in lines.into_iter().enumerate() {
                let row = u16::try_from(row).unwrap_or(u16::MAX);
                queue!(
                    out,
                    MoveTo(0, row),
                    Clear(ClearType::CurrentLine),
                    Print(line.trim_end_matches(LINE_ENDINGS))
                )?;
            }
            queue!(out, RestorePosition)
        })
    }

    pub fn echo(&self, ch: char) -> io::Result<()> {
        self.with_output(|out| queue!(out, Print(ch)))
    }

    pub fn erase_last_char(&self) -> io::Result<()> {
        self.with_output(|out| queue!(out, MoveLeft(1), Print(' '), MoveLeft(1)))
    }

    pub fn clear_input_line(&self) -> io::Result<()> {
        self.with_output(|out| queue!(out, Clear(ClearType::CurrentLine), MoveToColumn(0)))
    }

    pub fn prompt(&self, text: &str) -> io::Result<()> {
        self.with_output(|out| queue!(out, Print(text)))
    }
}

/// Rows available on the controlling terminal.
pub fn rows() -> io::Result<u16> {
    terminal::size().map(|(_, rows)| rows)
}

/// Keeps the terminal in raw mode until dropped.
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}
