// ABOUTME: Demultiplexer for the container attach stream's 8-byte framed format
// ABOUTME: Splits combined output into stdout/stderr with a raw-stdout fallback for unframed data

pub const HEADER_LEN: usize = 8;

/// Output channel encoded in byte 0 of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl Channel {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demuxed {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Number of complete frames parsed.
    pub frames: usize,
    /// Whole buffer was treated as stdout because no frame parsed.
    pub fell_back: bool,
}

/// Encode one frame in the attach wire format.
pub fn encode_frame(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(channel as u8);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a combined attach buffer into its stdout and stderr channels.
///
/// Parsing stops at the first header that is not a valid frame header and at
/// a trailing frame whose declared length runs past the buffer. Stdin frames
/// count as parsed but are dropped. If nothing parsed and the buffer is not
/// empty, the entire buffer is returned as stdout.
pub fn demultiplex(buf: &[u8]) -> Demuxed {
    let mut out = Demuxed::default();
    let mut offset = 0usize;

    while buf.len() - offset >= HEADER_LEN {
        let header = &buf[offset..offset + HEADER_LEN];
        let Some(channel) = Channel::from_byte(header[0]) else {
            break;
        };
        if header[1..4] != [0, 0, 0] {
            break;
        }
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let start = offset + HEADER_LEN;
        let Some(end) = start.checked_add(len).filter(|end| *end <= buf.len()) else {
            break;
        };

        match channel {
            Channel::Stdout => out.stdout.extend_from_slice(&buf[start..end]),
            Channel::Stderr => out.stderr.extend_from_slice(&buf[start..end]),
            Channel::Stdin => {}
        }
        out.frames += 1;
        offset = end;
    }

    if out.frames == 0 && !buf.is_empty() {
        out.stdout = buf.to_vec();
        out.fell_back = true;
    }

    out
}
