use std::{collections::VecDeque, io};

/// Invoked with the full history after every append.
pub type Redraw = Box<dyn FnMut(&VecDeque<String>) -> io::Result<()> + Send>;

/// The last `capacity` received lines, oldest first.
pub struct MessageStore {
    lines: VecDeque<String>,
    capacity: usize,
    redraw: Redraw,
}

impl MessageStore {
    /// `capacity` is clamped to at least one line.
    pub fn new(capacity: usize, redraw: Redraw) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            redraw,
        }
    }

    /// Stores `line`, evicting the oldest if full, then redraws before
    /// returning.
    pub fn append(&mut self, line: impl Into<String>) -> io::Result<()> {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
        (self.redraw)(&self.lines)
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
