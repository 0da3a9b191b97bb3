//! Frame reassembly over a fragmented byte stream.
//!
//! The stream is a run of concatenated top-level JSON objects. Network
//! reads split it anywhere: inside a string, between the bytes of one
//! UTF-8 character, right on a frame boundary. [`FrameReassembler`] keeps
//! the unconsumed tail between reads and scans every byte exactly once.
//! Consumed bytes are compacted away once per scan, when the buffer runs
//! out of complete frames, not once per frame.
//!
//! Scan state is brace depth, an in-string flag and a pending-escape flag.
//! A frame runs from the `{` that takes depth 0 to 1 up to the `}` that
//! brings it back to 0. Braces inside strings do not count, and a
//! backslash inside a string makes the next byte literal. Bytes at depth 0
//! outside any frame are noise and are dropped.

use playground_protocol::StreamFrame;

/// Incremental splitter of concatenated JSON objects.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: Vec<u8>,
    /// Next byte of `buf` to scan
    pos: usize,
    /// Start of the open frame; meaningful while `depth > 0`
    start: usize,
    depth: u32,
    in_string: bool,
    escape: bool,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, if the buffered bytes hold one.
    ///
    /// Returns `None` when more input is needed; scanning resumes where it
    /// stopped on the next call.
    pub fn next_frame(&mut self) -> Option<StreamFrame> {
        while self.pos < self.buf.len() {
            let at = self.pos;
            let byte = self.buf[at];
            self.pos += 1;

            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if byte == b'\\' {
                    self.escape = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' if self.depth > 0 => self.in_string = true,
                b'{' => {
                    if self.depth == 0 {
                        self.start = at;
                    }
                    self.depth += 1;
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(self.take_frame());
                    }
                }
                _ => {}
            }
        }

        self.compact();
        None
    }

    /// Drop everything before the open frame, or everything if none is open.
    fn compact(&mut self) {
        if self.depth == 0 {
            self.buf.clear();
            self.pos = 0;
        } else if self.start > 0 {
            self.buf.drain(..self.start);
            self.pos -= self.start;
            self.start = 0;
        }
    }

    /// Drain every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { inner: self }
    }

    /// Bytes not yet part of an emitted frame.
    pub fn pending_len(&self) -> usize {
        let from = if self.depth > 0 { self.start } else { self.pos };
        self.buf.len() - from
    }

    /// Copy out the frame that just closed; the buffer is compacted later.
    fn take_frame(&mut self) -> StreamFrame {
        let bytes = self.buf[self.start..self.pos].to_vec();

        let text = String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
        StreamFrame::classify(text)
    }
}

/// Iterator over the frames currently buffered in a [`FrameReassembler`].
pub struct Frames<'a> {
    inner: &'a mut FrameReassembler,
}

impl Iterator for Frames<'_> {
    type Item = StreamFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_frame()
    }
}
