//! Length-prefixed framing for the upstream wire protocol.
//!
//! Frames are `[u32 big-endian length][length bytes payload]`. `deframe`
//! consumes as many complete frames as are available in `buf` and returns
//! the unconsumed tail; callers append newly-read bytes to that tail and
//! call again.

use bytes::{Buf, BufMut, Bytes, BytesMut};

const LENGTH_PREFIX_LEN: usize = 4;

/// Wrap `payload` in a single length-prefixed frame.
pub fn frame(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out
}

/// Consume zero or more complete frames from `buf`.
///
/// A declared length of zero is treated as malformed: parsing stops and the
/// remaining buffer (including the zero-length header) is returned as the
/// tail so the caller can decide how to recover.
pub fn deframe(buf: &[u8]) -> (Vec<Bytes>, BytesMut) {
    let mut frames = Vec::new();
    let mut cursor = 0usize;

    loop {
        if buf.len() - cursor < LENGTH_PREFIX_LEN {
            break;
        }
        let len_bytes = &buf[cursor..cursor + LENGTH_PREFIX_LEN];
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        if len == 0 {
            break;
        }
        let len = len as usize;
        let frame_end = cursor + LENGTH_PREFIX_LEN + len;
        if buf.len() < frame_end {
            break;
        }
        let payload = &buf[cursor + LENGTH_PREFIX_LEN..frame_end];
        frames.push(Bytes::copy_from_slice(payload));
        cursor = frame_end;
    }

    let mut tail = BytesMut::with_capacity(buf.len() - cursor);
    tail.extend_from_slice(&buf[cursor..]);
    (frames, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_roundtrip() {
        let f = frame(b"hello");
        let (frames, tail) = deframe(&f);
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
        assert!(tail.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(b"one"));
        buf.extend_from_slice(&frame(b"two"));
        buf.extend_from_slice(&frame(b"three"));

        let (frames, tail) = deframe(&buf);
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three"),
            ]
        );
        assert!(tail.is_empty());
    }

    #[test]
    fn partial_frame_is_held_in_tail() {
        let full = frame(b"payload-data");
        let (frames, tail) = deframe(&full[..full.len() - 3]);
        assert!(frames.is_empty());
        assert_eq!(tail.len(), full.len() - 3);
    }

    #[test]
    fn incremental_chunks_match_single_shot() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(b"alpha"));
        buf.extend_from_slice(&frame(b"beta"));
        buf.extend_from_slice(&frame(b"gamma"));

        // Feed the same bytes in arbitrary small chunks and confirm the
        // sequence of recovered frames is identical to the one-shot parse.
        let (expected, _) = deframe(&buf);

        let mut acc = BytesMut::new();
        let mut recovered = Vec::new();
        for chunk in buf.chunks(3) {
            acc.extend_from_slice(chunk);
            let (frames, tail) = deframe(&acc);
            recovered.extend(frames);
            acc = tail;
        }

        assert_eq!(recovered, expected);
        assert!(acc.is_empty());
    }

    #[test]
    fn zero_length_is_malformed_and_preserves_tail() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_slice(b"garbage");
        let (frames, tail) = deframe(&buf);
        assert!(frames.is_empty());
        assert_eq!(tail.as_ref(), buf.as_ref());
    }

    #[test]
    fn empty_buffer_yields_no_frames() {
        let (frames, tail) = deframe(&[]);
        assert!(frames.is_empty());
        assert!(tail.is_empty());
    }
}
