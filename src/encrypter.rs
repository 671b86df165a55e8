//! Authenticated encryption for record cells.
//!
//! Layout, MSB first: `IV(24) | ENC(stream_id(4) | msg_type(1) | length(2) |
//! payload) | MAC(16)`. The body is XChaCha20 keystream under `expand(K1)`
//! with the IV as nonce; the tag is HMAC-SHA256 over `IV || body` under
//! `expand(K2)`, truncated to 16 bytes. Expansion is constant, so the record
//! layer can solve for padding exactly, and the header sits at a fixed
//! offset from the MSB so `length` is readable before full decryption.
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const IV_LEN: usize = 24;
pub const HEADER_LEN: usize = 4 + 1 + 2;
pub const MAC_LEN: usize = 16;
pub const CTXT_EXPANSION_BYTES: usize = IV_LEN + HEADER_LEN + MAC_LEN;
pub const CTXT_EXPANSION_BITS: usize = CTXT_EXPANSION_BYTES * 8;
/// Bytes needed from the top of a cell to read its header.
pub const PEEK_LEN: usize = IV_LEN + HEADER_LEN;

pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Data,
    Negotiate,
    NegotiateAck,
    EndOfStream,
}

impl MsgType {
    pub fn to_byte(self) -> u8 {
        match self {
            MsgType::Data => 0x00,
            MsgType::Negotiate => 0x01,
            MsgType::NegotiateAck => 0x02,
            MsgType::EndOfStream => 0x03,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(MsgType::Data),
            0x01 => Some(MsgType::Negotiate),
            0x02 => Some(MsgType::NegotiateAck),
            0x03 => Some(MsgType::EndOfStream),
            _ => None,
        }
    }
}

/// Cell header recovered before (or after) full decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellHeader {
    pub stream_id: u32,
    pub msg_type: MsgType,
    pub length: usize,
}

#[derive(Clone)]
pub struct Encrypter {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl Encrypter {
    /// Build from the two 128-bit subkeys; each is lifted to the 256 bits
    /// the primitives take with a single SHA-256.
    pub fn new(k1: &[u8; 16], k2: &[u8; 16]) -> Self {
        Self {
            enc_key: Sha256::digest(k1).into(),
            mac_key: Sha256::digest(k2).into(),
        }
    }

    /// Split a 256-bit session key into K1 (bytes 0..16) and K2 (16..32).
    pub fn from_session_key(key: &[u8; 32]) -> Self {
        let k1: [u8; 16] = key[..16].try_into().unwrap();
        let k2: [u8; 16] = key[16..].try_into().unwrap();
        Self::new(&k1, &k2)
    }

    /// Encrypt one cell. The ciphertext is exactly
    /// `CTXT_EXPANSION_BYTES + payload.len()` bytes.
    pub fn encrypt(&self, payload: &[u8], msg_type: MsgType, stream_id: u32) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::OutOfRange);
        }
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut body = Vec::with_capacity(HEADER_LEN + payload.len());
        body.extend_from_slice(&stream_id.to_be_bytes());
        body.push(msg_type.to_byte());
        body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        body.extend_from_slice(payload);
        self.keystream(&iv).apply_keystream(&mut body);

        let mut cell = Vec::with_capacity(CTXT_EXPANSION_BYTES + payload.len());
        cell.extend_from_slice(&iv);
        cell.extend_from_slice(&body);
        cell.extend_from_slice(&self.tag(&iv, &body));
        Ok(cell)
    }

    /// Verify the MAC, then decrypt. Any structural mismatch is the same
    /// unrecoverable failure as a bad tag.
    pub fn decrypt(&self, cell: &[u8]) -> Result<(MsgType, u32, Vec<u8>)> {
        if cell.len() < CTXT_EXPANSION_BYTES {
            return Err(Error::UnrecoverableDecryptionFailure);
        }
        let (iv, rest) = cell.split_at(IV_LEN);
        let (body, tag) = rest.split_at(rest.len() - MAC_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("any key length");
        mac.update(iv);
        mac.update(body);
        mac.verify_truncated_left(tag)
            .map_err(|_| Error::UnrecoverableDecryptionFailure)?;

        let mut plain = body.to_vec();
        self.keystream(iv).apply_keystream(&mut plain);
        let header = parse_header(&plain)?;
        if header.length != plain.len() - HEADER_LEN {
            return Err(Error::UnrecoverableDecryptionFailure);
        }
        Ok((header.msg_type, header.stream_id, plain.split_off(HEADER_LEN)))
    }

    /// Read the header from the first `PEEK_LEN` bytes of a cell, without
    /// authenticating. Used by the record decoder to solve for the padding
    /// width; the full MAC check still happens in `decrypt`.
    pub fn peek_header(&self, prefix: &[u8]) -> Result<CellHeader> {
        if prefix.len() < PEEK_LEN {
            return Err(Error::UnrecoverableDecryptionFailure);
        }
        let iv = &prefix[..IV_LEN];
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&prefix[IV_LEN..PEEK_LEN]);
        self.keystream(iv).apply_keystream(&mut header);
        parse_header(&header)
    }

    /// The authenticated stream id of a complete cell. Server-side
    /// demultiplexing only; the MAC is verified first.
    pub fn extract_stream_id(&self, cell: &[u8]) -> Result<u32> {
        let (_, stream_id, _) = self.decrypt(cell)?;
        Ok(stream_id)
    }

    fn keystream(&self, iv: &[u8]) -> XChaCha20 {
        XChaCha20::new(Key::from_slice(&self.enc_key), XNonce::from_slice(iv))
    }

    fn tag(&self, iv: &[u8], body: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("any key length");
        mac.update(iv);
        mac.update(body);
        let full = mac.finalize().into_bytes();
        full[..MAC_LEN].try_into().unwrap()
    }
}

fn parse_header(bytes: &[u8]) -> Result<CellHeader> {
    let stream_id = u32::from_be_bytes(bytes[..4].try_into().unwrap());
    let msg_type =
        MsgType::from_byte(bytes[4]).ok_or(Error::UnrecoverableDecryptionFailure)?;
    let length = u16::from_be_bytes(bytes[5..7].try_into().unwrap()) as usize;
    Ok(CellHeader {
        stream_id,
        msg_type,
        length,
    })
}
