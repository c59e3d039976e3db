//! Length-prefixed frame codec for the narrow transport
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  4 bytes: u32 little-endian length           │
//! ├──────────────────────────────────────────────┤
//! │  N bytes: UTF-8 JSON body                    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The codec only deals in opaque byte bodies. Decoding the JSON inside is
//! the router's job.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::config::defaults::{DEFAULT_MAX_INBOUND_FRAME_BYTES, DEFAULT_MAX_OUTBOUND_FRAME_BYTES};
use crate::error::GatewayError;

/// Size of the length prefix
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Errors raised while reading or writing frames
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Stream closed mid-frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
}

impl From<FrameError> for GatewayError {
    fn from(err: FrameError) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// Codec for `<u32 LE length><body>` frames
///
/// Partial input is buffered across calls; a frame is only yielded once all
/// of its bytes have arrived.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_inbound: usize,
    max_outbound: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INBOUND_FRAME_BYTES, DEFAULT_MAX_OUTBOUND_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_inbound: usize, max_outbound: usize) -> Self {
        Self {
            max_inbound,
            max_outbound,
        }
    }

    pub fn max_outbound(&self) -> usize {
        self.max_outbound
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_le_bytes(prefix) as usize;

        if length > self.max_inbound {
            return Err(FrameError::FrameTooLarge {
                size: length,
                max: self.max_inbound,
            });
        }

        let total = LENGTH_PREFIX_BYTES + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let expected = if src.len() >= LENGTH_PREFIX_BYTES {
                    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
                    prefix.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
                    LENGTH_PREFIX_BYTES + u32::from_le_bytes(prefix) as usize
                } else {
                    LENGTH_PREFIX_BYTES
                };
                Err(FrameError::Truncated {
                    expected,
                    received: src.len(),
                })
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if body.len() > self.max_outbound || body.len() > u32::MAX as usize {
            return Err(FrameError::FrameTooLarge {
                size: body.len(),
                max: self.max_outbound,
            });
        }

        dst.reserve(LENGTH_PREFIX_BYTES + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Frame reader over any async byte source
pub type FrameReader<R> = FramedRead<R, FrameCodec>;

/// Frame writer over any async byte sink
pub type FrameWriter<W> = FramedWrite<W, FrameCodec>;

/// Encode a single body into a standalone frame
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn sample_frames() -> Vec<Vec<u8>> {
        vec![
            br#"{"id":"1","type":"ping"}"#.to_vec(),
            Vec::new(),
            br#"{"id":"2","type":"subscribe","channel":"/event/Order_Event__e"}"#.to_vec(),
            "{\"id\":\"3\",\"note\":\"héllo ☃\"}".as_bytes().to_vec(),
            vec![b'x'; 70_000],
        ]
    }

    fn wire(frames: &[Vec<u8>]) -> Vec<u8> {
        frames.iter().flat_map(|f| encode_frame(f)).collect()
    }

    /// Feed `input` to a decoder in the given chunk sizes and collect frames
    fn decode_in_chunks(input: &[u8], chunk_sizes: &[usize]) -> Vec<Vec<u8>> {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().cycle();

        while offset < input.len() {
            let size = (*sizes.next().unwrap()).max(1);
            let end = (offset + size).min(input.len());
            buf.extend_from_slice(&input[offset..end]);
            offset = end;
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                out.push(frame.to_vec());
            }
        }
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        out
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(br#"{"id":"1"}"#), &mut buf)
            .unwrap();
        assert_eq!(&buf[..4], &10u32.to_le_bytes());

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"id":"1"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_every_split_point_reconstructs_frames() {
        let frames = sample_frames()[..4].to_vec();
        let input = wire(&frames);

        for split in 0..=input.len() {
            let mut codec = FrameCodec::default();
            let mut buf = BytesMut::from(&input[..split]);
            let mut out = Vec::new();
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                out.push(frame.to_vec());
            }
            buf.extend_from_slice(&input[split..]);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                out.push(frame.to_vec());
            }
            assert_eq!(out, frames, "split at {split}");
        }
    }

    #[test]
    fn test_random_chunking_reconstructs_frames() {
        let frames = sample_frames();
        let input = wire(&frames);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let sizes: Vec<usize> = (0..16).map(|_| rng.gen_range(1..4096)).collect();
            assert_eq!(decode_in_chunks(&input, &sizes), frames);
        }

        assert_eq!(decode_in_chunks(&input, &[1]), frames);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = FrameCodec::new(1024, 1024);
        let mut buf = BytesMut::new();
        buf.put_u32_le(4096);
        buf.extend_from_slice(b"partial");

        match codec.decode(&mut buf) {
            Err(FrameError::FrameTooLarge { size, max }) => {
                assert_eq!(size, 4096);
                assert_eq!(max, 1024);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_frame_at_eof() {
        let mut codec = FrameCodec::default();
        let full = encode_frame(b"0123456789");
        let mut buf = BytesMut::from(&full[..7]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        match codec.decode_eof(&mut buf) {
            Err(FrameError::Truncated { expected, received }) => {
                assert_eq!(expected, 14);
                assert_eq!(received, 7);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn test_clean_eof_yields_none() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_outbound_ceiling_enforced() {
        let mut codec = FrameCodec::new(1024, 16);
        let mut buf = BytesMut::new();
        let err = codec.encode(Bytes::from(vec![0u8; 17]), &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 17, max: 16 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_error_is_transport_error() {
        let err: GatewayError = FrameError::FrameTooLarge { size: 2, max: 1 }.into();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_framed_reader_over_async_source() {
        use futures::StreamExt;

        let frames = sample_frames();
        let input = wire(&frames);
        let mut reader = FrameReader::new(&input[..], FrameCodec::default());
        let mut out = Vec::new();
        while let Some(frame) = reader.next().await {
            out.push(frame.unwrap().to_vec());
        }
        assert_eq!(out, frames);
    }

    #[tokio::test]
    async fn test_framed_writer_emits_wire_format() {
        use futures::SinkExt;

        let mut sink = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut sink, FrameCodec::default());
            writer.send(Bytes::from_static(b"abc")).await.unwrap();
            writer.send(Bytes::from_static(b"")).await.unwrap();
        }
        let mut expected = encode_frame(b"abc");
        expected.extend(encode_frame(b""));
        assert_eq!(sink, expected);
    }
}
