//! Language negotiation: one cell from the client selects the regex pair.
//!
//! The client encrypts a 64-byte hello under its chosen `*-request` encoder.
//! The server, which has no codecs installed yet, trial-decodes the first
//! template of every known request language until one authenticates, then
//! installs `<base>-request` / `<base>-response` and answers with an
//! acknowledgement cell on the response language.
use crate::defs::{self, Definitions, REQUEST_SUFFIX, RESPONSE_SUFFIX};
use crate::encoder::EncoderRegistry;
use crate::encrypter::{Encrypter, MsgType};
use crate::errors::{Error, Result};
use crate::record::{RecordDecoder, RecordEncoder};

pub const CELL_LEN: usize = 64;
const PADDING_LEN: usize = 32;
const DATE_LEN: usize = 8;
const NAME_LEN: usize = CELL_LEN - PADDING_LEN - DATE_LEN;

/// The negotiation payload: 32 NUL bytes, the `YYYYMMDD` release tag of the
/// definitions file, then the language base name left-justified and
/// NUL-padded to 24 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateCell {
    def_file: String,
    language: String,
}

impl NegotiateCell {
    pub fn new(def_file: &str, language: &str) -> Result<Self> {
        if def_file.len() != DATE_LEN
            || language.is_empty()
            || language.len() > NAME_LEN
            || language.bytes().any(|b| b == 0)
        {
            return Err(Error::NegotiationFailed);
        }
        Ok(Self {
            def_file: def_file.to_string(),
            language: language.to_string(),
        })
    }

    pub fn def_file(&self) -> &str {
        &self.def_file
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn to_bytes(&self) -> [u8; CELL_LEN] {
        let mut out = [0u8; CELL_LEN];
        out[PADDING_LEN..PADDING_LEN + DATE_LEN].copy_from_slice(self.def_file.as_bytes());
        let name = self.language.as_bytes();
        out[PADDING_LEN + DATE_LEN..PADDING_LEN + DATE_LEN + name.len()].copy_from_slice(name);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CELL_LEN || bytes[..PADDING_LEN].iter().any(|&b| b != 0) {
            return Err(Error::NegotiationFailed);
        }
        let def_file = std::str::from_utf8(&bytes[PADDING_LEN..PADDING_LEN + DATE_LEN])
            .map_err(|_| Error::NegotiationFailed)?;
        let name_field = &bytes[PADDING_LEN + DATE_LEN..];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        let language =
            std::str::from_utf8(&name_field[..name_len]).map_err(|_| Error::NegotiationFailed)?;
        Self::new(def_file, language)
    }
}

/// Both per-stream codecs, constructed together so the decoder exists
/// before the first receive.
pub struct ClientCodecs {
    pub encoder: RecordEncoder,
    pub decoder: RecordDecoder,
}

pub fn build_client_codecs(
    stream_id: u32,
    encrypter: &Encrypter,
    registry: &EncoderRegistry,
    upstream: &str,
    downstream: &str,
    max_cell: usize,
) -> Result<ClientCodecs> {
    let encoder = RecordEncoder::new(
        stream_id,
        encrypter.clone(),
        registry.get(upstream)?,
        max_cell,
    )?;
    let decoder = RecordDecoder::new(stream_id, encrypter.clone(), registry.get(downstream)?)?;
    Ok(ClientCodecs { encoder, decoder })
}

/// The single client->server hello covertext.
pub fn client_hello(encoder: &RecordEncoder, release: &str) -> Result<Vec<u8>> {
    let cell = NegotiateCell::new(release, defs::base_name(encoder.language()))?;
    encoder.encode_cell(MsgType::Negotiate, &cell.to_bytes())
}

/// Poll for the server's acknowledgement on the (already installed) client
/// decoder. `Ok(false)` means a full cell has not arrived yet.
pub fn check_acknowledge(decoder: &mut RecordDecoder) -> Result<bool> {
    match decoder.pop_cell() {
        Ok((MsgType::NegotiateAck, _, _)) => Ok(true),
        Ok(_) => Err(Error::UnrecoverableDecryptionFailure),
        Err(Error::PopFailed) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Everything the server installs once a hello authenticates.
pub struct ServerNegotiation {
    pub language_base: String,
    pub release: String,
    /// The authenticated stream id the client stamped into the hello; the
    /// installed codecs carry it so demultiplexing checks line up.
    pub stream_id: u32,
    /// Acknowledgement covertext to send back on the tunnel.
    pub ack: Vec<u8>,
    pub encoder: RecordEncoder,
    /// Seeded with whatever followed the hello in the buffer.
    pub decoder: RecordDecoder,
}

/// Trial-decode `data` against every known `*-request` language.
///
/// `ChannelNotReady` asks the caller to retry with more bytes (some trial
/// did not have a full template yet); `NegotiationFailed` is final.
pub fn accept_negotiation(
    stream_id: u32,
    encrypter: &Encrypter,
    definitions: &Definitions,
    registry: &EncoderRegistry,
    data: &[u8],
    max_cell: usize,
) -> Result<ServerNegotiation> {
    let mut saw_short = false;
    for name in definitions.request_languages() {
        let trial_encoder = match registry.get(name) {
            Ok(e) => e,
            Err(_) => continue,
        };
        if data.len() < trial_encoder.template_len() {
            saw_short = true;
            continue;
        }
        let mut trial = RecordDecoder::new(stream_id, encrypter.clone(), trial_encoder)?;
        trial.push(data);
        let (msg_type, hello_stream_id, payload) = match trial.pop_cell() {
            Ok(cell) => cell,
            Err(_) => continue,
        };
        if msg_type != MsgType::Negotiate {
            continue;
        }
        let cell = match NegotiateCell::from_bytes(&payload) {
            Ok(cell) => cell,
            Err(_) => continue,
        };

        let incoming = format!("{}{}", cell.language(), REQUEST_SUFFIX);
        let outgoing = format!("{}{}", cell.language(), RESPONSE_SUFFIX);
        let encoder = RecordEncoder::new(
            hello_stream_id,
            encrypter.clone(),
            registry.get(&outgoing)?,
            max_cell,
        )?;
        let mut decoder =
            RecordDecoder::new(hello_stream_id, encrypter.clone(), registry.get(&incoming)?)?;
        decoder.push(&trial.take_buffer());
        let ack = encoder.encode_cell(MsgType::NegotiateAck, b"")?;
        return Ok(ServerNegotiation {
            language_base: cell.language().to_string(),
            release: cell.def_file().to_string(),
            stream_id: hello_stream_id,
            ack,
            encoder,
            decoder,
        });
    }
    if saw_short {
        Err(Error::ChannelNotReady)
    } else {
        Err(Error::NegotiationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::load_definitions;
    use pretty_assertions::assert_eq;

    #[test]
    fn cell_layout_matches_the_wire_format() {
        let cell = NegotiateCell::new("20250115", "http").unwrap();
        let bytes = cell.to_bytes();
        assert_eq!(&bytes[..32], &[0u8; 32]);
        assert_eq!(&bytes[32..40], b"20250115");
        assert_eq!(&bytes[40..44], b"http");
        assert_eq!(&bytes[44..], &[0u8; 20]);
        assert_eq!(NegotiateCell::from_bytes(&bytes).unwrap(), cell);
    }

    #[test]
    fn malformed_cells_are_rejected() {
        assert!(NegotiateCell::new("2025", "http").is_err());
        assert!(NegotiateCell::new("20250115", "").is_err());
        let mut bytes = NegotiateCell::new("20250115", "http").unwrap().to_bytes();
        bytes[0] = 1;
        assert!(NegotiateCell::from_bytes(&bytes).is_err());
    }

    fn setup() -> (Encrypter, &'static Definitions, EncoderRegistry) {
        let definitions = load_definitions();
        let registry = EncoderRegistry::build_all(definitions).unwrap();
        (Encrypter::from_session_key(&[0x33; 32]), definitions, registry)
    }

    #[test]
    fn server_installs_exactly_the_hello_language() {
        let (encrypter, definitions, registry) = setup();
        let codecs = build_client_codecs(
            7,
            &encrypter,
            &registry,
            "ftp-request",
            "ftp-response",
            4096,
        )
        .unwrap();
        let hello = client_hello(&codecs.encoder, definitions.release()).unwrap();

        let installed =
            accept_negotiation(7, &encrypter, definitions, &registry, &hello, 4096).unwrap();
        assert_eq!(installed.language_base, "ftp");
        assert_eq!(installed.release, "20250115");
        assert_eq!(installed.encoder.language(), "ftp-response");
        assert_eq!(installed.decoder.language(), "ftp-request");
        assert!(!installed.decoder.has_pending());
    }

    #[test]
    fn trailing_bytes_survive_into_the_installed_decoder() {
        let (encrypter, definitions, registry) = setup();
        let mut codecs = build_client_codecs(
            7,
            &encrypter,
            &registry,
            "ftp-request",
            "ftp-response",
            4096,
        )
        .unwrap();
        let mut data = client_hello(&codecs.encoder, definitions.release()).unwrap();
        codecs.encoder.push(b"early data");
        let first = codecs.encoder.pop().unwrap().unwrap();
        data.extend_from_slice(&first);

        let mut installed =
            accept_negotiation(7, &encrypter, definitions, &registry, &data, 4096).unwrap();
        let (fragment, _) = installed.decoder.pop().unwrap().unwrap();
        assert_eq!(fragment, b"early data");
    }

    #[test]
    fn short_input_asks_for_more() {
        let (encrypter, definitions, registry) = setup();
        let result = accept_negotiation(7, &encrypter, definitions, &registry, b"GET /", 4096);
        assert!(matches!(result, Err(Error::ChannelNotReady)));
    }

    #[test]
    fn full_garbage_is_a_final_failure() {
        let (encrypter, definitions, registry) = setup();
        let garbage = vec![b'Z'; 512];
        let result = accept_negotiation(7, &encrypter, definitions, &registry, &garbage, 4096);
        assert!(matches!(result, Err(Error::NegotiationFailed)));
    }

    #[test]
    fn acknowledge_round_trip() {
        let (encrypter, definitions, registry) = setup();
        let mut codecs = build_client_codecs(
            7,
            &encrypter,
            &registry,
            "ftp-request",
            "ftp-response",
            4096,
        )
        .unwrap();
        let hello = client_hello(&codecs.encoder, definitions.release()).unwrap();
        let installed =
            accept_negotiation(7, &encrypter, definitions, &registry, &hello, 4096).unwrap();

        assert!(!check_acknowledge(&mut codecs.decoder).unwrap());
        codecs.decoder.push(&installed.ack);
        assert!(check_acknowledge(&mut codecs.decoder).unwrap());
    }
}
