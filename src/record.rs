//! Record layer: byte streams in and out of fixed-length covert strings.
//!
//! The encoder frames plaintext into encrypted cells, pads each cell with
//! random low bits up to the language capacity, and ranks the result into a
//! conformant string. Every emitted string has length exactly
//! `template_len()`, so concatenated emissions are self-delimiting. The
//! decoder inverts: take one template worth of bytes, unrank, read the
//! authenticated length to strip the padding, verify and decrypt.
use std::time::Instant;

use num_bigint::{BigUint, RandBigInt};

use crate::encoder::RegexEncoder;
use crate::encrypter::{
    Encrypter, MsgType, CTXT_EXPANSION_BYTES, MAX_PAYLOAD, PEEK_LEN,
};
use crate::errors::{Error, Result};

/// Smallest usable language: one cell with a single payload byte.
const MIN_CAPACITY_BITS: usize = (CTXT_EXPANSION_BYTES + 1) * 8;

fn check_capacity(encoder: &RegexEncoder) -> Result<()> {
    if encoder.capacity() < MIN_CAPACITY_BITS {
        return Err(Error::InsufficientCapacity(
            encoder.capacity(),
            MIN_CAPACITY_BITS,
        ));
    }
    Ok(())
}

/// Left-pad the big-endian bytes of `value` to exactly `len` bytes.
fn to_fixed_bytes(value: &BigUint, len: usize) -> Result<Vec<u8>> {
    let raw = value.to_bytes_be();
    if raw.len() > len {
        return Err(Error::UnrecoverableDecryptionFailure);
    }
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    Ok(out)
}

pub struct RecordEncoder {
    stream_id: u32,
    encrypter: Encrypter,
    encoder: RegexEncoder,
    incoming: Vec<u8>,
    /// Plaintext bytes consumed per cell.
    payload_budget: usize,
    last_pushed: Instant,
}

impl RecordEncoder {
    pub fn new(
        stream_id: u32,
        encrypter: Encrypter,
        encoder: RegexEncoder,
        max_cell: usize,
    ) -> Result<Self> {
        check_capacity(&encoder)?;
        let by_capacity = (encoder.capacity() - CTXT_EXPANSION_BYTES * 8) / 8;
        Ok(Self {
            stream_id,
            encrypter,
            encoder,
            incoming: Vec::new(),
            payload_budget: max_cell.max(1).min(by_capacity).min(MAX_PAYLOAD),
            last_pushed: Instant::now(),
        })
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn template_len(&self) -> usize {
        self.encoder.template_len()
    }

    pub fn language(&self) -> &str {
        self.encoder.language()
    }

    pub fn has_pending(&self) -> bool {
        !self.incoming.is_empty()
    }

    pub fn last_pushed(&self) -> Instant {
        self.last_pushed
    }

    pub fn push(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.incoming.extend_from_slice(data);
            self.last_pushed = Instant::now();
        }
    }

    /// Emit the next covert string, or `None` when nothing is buffered.
    pub fn pop(&mut self) -> Result<Option<Vec<u8>>> {
        if self.incoming.is_empty() {
            return Ok(None);
        }
        let take = self.incoming.len().min(self.payload_budget);
        let chunk: Vec<u8> = self.incoming.drain(..take).collect();
        let covertext = self.encode_cell(MsgType::Data, &chunk)?;
        Ok(Some(covertext))
    }

    /// Encrypt, pad and rank one cell, bypassing the plaintext buffer.
    /// Negotiation and end-of-stream cells go through here.
    pub fn encode_cell(&self, msg_type: MsgType, payload: &[u8]) -> Result<Vec<u8>> {
        let capacity = self.encoder.capacity();
        let cell = self.encrypter.encrypt(payload, msg_type, self.stream_id)?;
        let n = cell.len() * 8;
        if n > capacity {
            return Err(Error::InsufficientCapacity(capacity, n));
        }
        // The length field inside the cell is authenticated, so the padding
        // below it need not be.
        let pad_bits = capacity - n;
        let mut bits = BigUint::from_bytes_be(&cell);
        if pad_bits > 0 {
            bits <<= pad_bits;
            bits |= rand::thread_rng().gen_biguint(pad_bits as u64);
        }
        self.encoder.encode(&bits)
    }
}

pub struct RecordDecoder {
    stream_id: u32,
    encrypter: Encrypter,
    encoder: RegexEncoder,
    incoming: Vec<u8>,
    last_pushed: Instant,
}

impl RecordDecoder {
    pub fn new(stream_id: u32, encrypter: Encrypter, encoder: RegexEncoder) -> Result<Self> {
        check_capacity(&encoder)?;
        Ok(Self {
            stream_id,
            encrypter,
            encoder,
            incoming: Vec::new(),
            last_pushed: Instant::now(),
        })
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn template_len(&self) -> usize {
        self.encoder.template_len()
    }

    pub fn language(&self) -> &str {
        self.encoder.language()
    }

    pub fn has_pending(&self) -> bool {
        !self.incoming.is_empty()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.incoming
    }

    /// Hand back everything not yet decoded (post-negotiation handoff,
    /// end-of-stream demultiplexing).
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.incoming)
    }

    pub fn last_pushed(&self) -> Instant {
        self.last_pushed
    }

    pub fn push(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.incoming.extend_from_slice(data);
            self.last_pushed = Instant::now();
        }
    }

    /// Decode the next data fragment. `Ok(None)` means a full template is
    /// not buffered yet; the `bool` says whether another one already is.
    pub fn pop(&mut self) -> Result<Option<(Vec<u8>, bool)>> {
        if self.incoming.len() < self.template_len() {
            return Ok(None);
        }
        let (msg_type, _, payload) = self.pop_cell()?;
        match msg_type {
            MsgType::Data => {
                let more = self.incoming.len() >= self.template_len();
                Ok(Some((payload, more)))
            }
            MsgType::EndOfStream => Err(Error::EndOfStream),
            // Negotiation cells are consumed before the data phase starts.
            MsgType::Negotiate | MsgType::NegotiateAck => {
                Err(Error::UnrecoverableDecryptionFailure)
            }
        }
    }

    /// Decode exactly one cell and return its header fields. The trial
    /// decodes of negotiation use this; `PopFailed` means "feed me more".
    pub fn pop_cell(&mut self) -> Result<(MsgType, u32, Vec<u8>)> {
        let template = self.template_len();
        if self.incoming.len() < template {
            return Err(Error::PopFailed);
        }
        let covertext: Vec<u8> = self.incoming.drain(..template).collect();
        self.decode_cell(&covertext)
    }

    /// Authenticated stream id of a covertext cell, without consuming the
    /// buffer. The server demultiplexer uses this to spot foreign cells.
    pub fn peek_stream_id(&self, covertext: &[u8]) -> Result<u32> {
        let (_, stream_id, _) = self.decode_cell(covertext)?;
        Ok(stream_id)
    }

    fn decode_cell(&self, covertext: &[u8]) -> Result<(MsgType, u32, Vec<u8>)> {
        let capacity = self.encoder.capacity();
        let bits = self.encoder.decode(covertext)?;
        if bits.bits() as usize > capacity {
            // In the slice but above anything the encoder could emit.
            return Err(Error::UnrecoverableDecryptionFailure);
        }
        let prefix = to_fixed_bytes(&(&bits >> (capacity - PEEK_LEN * 8)), PEEK_LEN)?;
        let header = self.encrypter.peek_header(&prefix)?;
        let n = (CTXT_EXPANSION_BYTES + header.length) * 8;
        if n > capacity {
            return Err(Error::UnrecoverableDecryptionFailure);
        }
        let cell = to_fixed_bytes(&(&bits >> (capacity - n)), n / 8)?;
        self.encrypter.decrypt(&cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::load_definitions;
    use crate::encoder::EncoderRegistry;
    use pretty_assertions::assert_eq;

    fn codec_pair(stream_id: u32) -> (RecordEncoder, RecordDecoder) {
        let registry = EncoderRegistry::build(load_definitions(), &["ftp-request"]).unwrap();
        let encrypter = Encrypter::from_session_key(&[0x11; 32]);
        let enc = RecordEncoder::new(
            stream_id,
            encrypter.clone(),
            registry.get("ftp-request").unwrap(),
            4096,
        )
        .unwrap();
        let dec =
            RecordDecoder::new(stream_id, encrypter, registry.get("ftp-request").unwrap()).unwrap();
        (enc, dec)
    }

    fn drain(enc: &mut RecordEncoder) -> Vec<u8> {
        let mut wire = Vec::new();
        while let Some(covertext) = enc.pop().unwrap() {
            assert_eq!(covertext.len(), enc.template_len());
            wire.extend_from_slice(&covertext);
        }
        wire
    }

    #[test]
    fn round_trip_across_multiple_cells() {
        let (mut enc, mut dec) = codec_pair(5);
        let message: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        enc.push(&message);
        let wire = drain(&mut enc);
        assert!(wire.len() % enc.template_len() == 0);

        dec.push(&wire);
        let mut out = Vec::new();
        while let Some((fragment, _)) = dec.pop().unwrap() {
            out.extend_from_slice(&fragment);
        }
        assert_eq!(out, message);
    }

    #[test]
    fn arbitrary_fragmentation_does_not_matter() {
        let (mut enc, mut dec) = codec_pair(5);
        let message = b"fragmentation should be invisible to the decoder".to_vec();
        enc.push(&message);
        let wire = drain(&mut enc);

        let mut out = Vec::new();
        for chunk in wire.chunks(7) {
            dec.push(chunk);
            while let Some((fragment, _)) = dec.pop().unwrap() {
                out.extend_from_slice(&fragment);
            }
        }
        assert_eq!(out, message);
    }

    #[test]
    fn end_of_stream_surfaces_as_an_error() {
        let (enc, mut dec) = codec_pair(5);
        let covertext = enc.encode_cell(MsgType::EndOfStream, b"").unwrap();
        dec.push(&covertext);
        assert!(matches!(dec.pop(), Err(Error::EndOfStream)));
    }

    #[test]
    fn tampered_cell_is_unrecoverable() {
        let (mut enc, mut dec) = codec_pair(5);
        enc.push(b"tamper with me");
        let mut wire = drain(&mut enc);
        // Swap one symbol in the free region for another member of the
        // character class, so the string stays in the language and the
        // failure is cryptographic, not a rank failure.
        let mid = wire.len() / 2;
        wire[mid] = if wire[mid] == b'a' { b'b' } else { b'a' };
        dec.push(&wire);
        assert!(matches!(
            dec.pop(),
            Err(Error::UnrecoverableDecryptionFailure)
        ));
    }

    #[test]
    fn pop_needs_a_full_template() {
        let (mut enc, mut dec) = codec_pair(5);
        assert!(enc.pop().unwrap().is_none());
        dec.push(b"USER short");
        assert!(dec.pop().unwrap().is_none());
        assert!(matches!(dec.pop_cell(), Err(Error::PopFailed)));
    }

    #[test]
    fn tiny_languages_are_rejected() {
        let def = crate::defs::LanguageDef {
            regex: "[ab]*".into(),
            fixed_slice: 8,
        };
        let tiny = RegexEncoder::new("tiny", &def).unwrap();
        let encrypter = Encrypter::from_session_key(&[0x11; 32]);
        assert!(matches!(
            RecordEncoder::new(1, encrypter, tiny, 4096),
            Err(Error::InsufficientCapacity(_, _))
        ));
    }
}
