// Length-prefix frame accounting over a stream of read chunks.
//
// The proxy fast path forwards whatever the kernel handed us without copying,
// but the pipelines still need to know which frames went by: 'Z' carries the
// transaction state, 'E' the severity, 'P' the statement name. Frames
// routinely straddle read boundaries, so the scanner carries partial headers
// and the first few payload bytes across calls.

/// How many payload bytes are captured per frame. Enough for the transaction
/// state byte of 'Z' and the severity field of 'E'.
pub const FRAME_PEEK: usize = 8;

/// One observed frame: its kind, full length, and the first few payload bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameEvent {
    pub kind: u8,
    pub len: i32,
    pub peek: [u8; FRAME_PEEK],
    pub peek_len: usize,
}

impl FrameEvent {
    pub fn peek_bytes(&self) -> &[u8] {
        &self.peek[..self.peek_len]
    }
}

#[derive(Debug, Default)]
pub struct FrameScanner {
    header: [u8; 5],
    header_fill: usize,
    payload_left: usize,
    pending: Option<(u8, i32)>,
    peek: [u8; FRAME_PEEK],
    peek_fill: usize,
    peek_want: usize,
}

impl FrameScanner {
    pub fn new() -> FrameScanner {
        FrameScanner::default()
    }

    /// True when the scanner sits exactly on a frame boundary.
    pub fn at_boundary(&self) -> bool {
        self.header_fill == 0 && self.payload_left == 0 && self.pending.is_none()
    }

    /// Account for one read chunk, appending an event per frame whose header
    /// (and peek window) completed inside it.
    pub fn scan(&mut self, mut chunk: &[u8], events: &mut Vec<FrameEvent>) {
        while !chunk.is_empty() {
            // A frame header is complete but its peek window is not.
            if let Some((kind, len)) = self.pending {
                let want = (self.peek_want - self.peek_fill)
                    .min(chunk.len())
                    .min(self.payload_left);
                self.peek[self.peek_fill..self.peek_fill + want]
                    .copy_from_slice(&chunk[..want]);
                self.peek_fill += want;
                self.payload_left -= want;
                chunk = &chunk[want..];

                if self.peek_fill == self.peek_want {
                    events.push(FrameEvent {
                        kind,
                        len,
                        peek: self.peek,
                        peek_len: self.peek_fill,
                    });
                    self.pending = None;
                }
                continue;
            }

            // Skipping the remainder of an already-reported frame.
            if self.payload_left > 0 {
                let skip = self.payload_left.min(chunk.len());
                self.payload_left -= skip;
                chunk = &chunk[skip..];
                continue;
            }

            // Accumulating a header, possibly across chunks.
            let want = (5 - self.header_fill).min(chunk.len());
            self.header[self.header_fill..self.header_fill + want]
                .copy_from_slice(&chunk[..want]);
            self.header_fill += want;
            chunk = &chunk[want..];

            if self.header_fill < 5 {
                return;
            }

            let kind = self.header[0];
            let len = i32::from_be_bytes([
                self.header[1],
                self.header[2],
                self.header[3],
                self.header[4],
            ]);
            self.header_fill = 0;
            self.payload_left = (len.max(4) - 4) as usize;
            self.peek_want = FRAME_PEEK.min(self.payload_left);
            self.peek_fill = 0;

            if self.peek_want == 0 {
                events.push(FrameEvent {
                    kind,
                    len,
                    peek: [0; FRAME_PEEK],
                    peek_len: 0,
                });
            } else {
                self.pending = Some((kind, len));
            }
        }
    }
}
