use memchr::memchr2;

/// Accumulates decoded telnet data and splits it into lines.
///
/// Telnet tends to send CRLF, but can also send CRNUL or a bare LF.
/// `\n` and `\r` both end a line; a `\r` followed by `\n` or `\0` consumes both.
#[derive(Debug)]
pub struct LineBuf {
    buf: Vec<u8>,
    max_line_len: usize,
    // A lone `\r` ended the previous line; swallow a following `\n`/`\0`.
    pending_cr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong;

impl std::fmt::Display for LineTooLong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line too long")
    }
}

impl std::error::Error for LineTooLong {}

impl Default for LineBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuf {
    pub fn new() -> Self {
        Self::with_capacity(8 * 1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(64 * 1024)),
            max_line_len: cap.max(1),
            pending_cr: false,
        }
    }

    /// Append bytes. Fails once more than `max_line_len` bytes are buffered without an EOL.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), LineTooLong> {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.max_line_len && memchr2(b'\n', b'\r', &self.buf).is_none() {
            return Err(LineTooLong);
        }
        Ok(())
    }

    /// Pop one complete line without its terminator.
    pub fn pop_line(&mut self) -> Option<Vec<u8>> {
        if self.pending_cr {
            match self.buf.first() {
                Some(b'\n') | Some(0) => {
                    self.buf.remove(0);
                    self.pending_cr = false;
                }
                Some(_) => self.pending_cr = false,
                None => {}
            }
        }

        let i = memchr2(b'\n', b'\r', &self.buf)?;
        let mut line = self.buf.drain(0..=i).collect::<Vec<u8>>();
        let eol = line.pop();
        if eol == Some(b'\r') {
            match self.buf.first() {
                Some(b'\n') | Some(0) => {
                    self.buf.remove(0);
                }
                Some(_) => {}
                // The LF/NUL may still be in flight.
                None => self.pending_cr = true,
            }
        }
        Some(line)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Trim ASCII whitespace from both ends.
pub fn trim_ascii_ws(s: &[u8]) -> &[u8] {
    let mut a = 0usize;
    let mut b = s.len();
    while a < b && s[a].is_ascii_whitespace() {
        a += 1;
    }
    while b > a && s[b - 1].is_ascii_whitespace() {
        b -= 1;
    }
    &s[a..b]
}
