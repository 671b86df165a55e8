//! Regex encoder: integer payloads in and out of conformant strings.
//!
//! A `RegexEncoder` is a cheap handle over a shared, immutable `Dfa`; every
//! stream clones the handle, never the tables.
use std::collections::HashMap;
use std::sync::Arc;

use num_bigint::BigUint;

use crate::defs::{Definitions, LanguageDef};
use crate::dfa::Dfa;
use crate::errors::{Error, Result};

#[derive(Clone)]
pub struct RegexEncoder {
    language: String,
    dfa: Arc<Dfa>,
}

impl RegexEncoder {
    pub fn new(language: &str, def: &LanguageDef) -> Result<Self> {
        let dfa = Dfa::from_regex(&def.regex, def.fixed_slice)?;
        Ok(Self {
            language: language.to_string(),
            dfa: Arc::new(dfa),
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Size in bits of the integers `encode` accepts.
    pub fn capacity(&self) -> usize {
        self.dfa.capacity()
    }

    /// Length of every string this encoder produces and consumes.
    pub fn template_len(&self) -> usize {
        self.dfa.max_len()
    }

    /// Encode an integer of at most `capacity()` bits as a conformant string.
    pub fn encode(&self, payload: &BigUint) -> Result<Vec<u8>> {
        if payload.bits() as usize > self.dfa.capacity() {
            return Err(Error::OutOfRange);
        }
        self.dfa.unrank(payload)
    }

    /// Recover the integer from a string of exactly `template_len()` bytes.
    pub fn decode(&self, covertext: &[u8]) -> Result<BigUint> {
        self.dfa.rank(covertext)
    }
}

/// One compiled encoder per language name, built once at startup.
///
/// The server warms every known language before accepting so trial decoding
/// during negotiation never compiles a DFA on the connection path; the
/// client only needs its configured pair.
pub struct EncoderRegistry {
    encoders: HashMap<String, RegexEncoder>,
}

impl EncoderRegistry {
    pub fn build_all(defs: &Definitions) -> Result<Self> {
        Self::build(defs, &defs.names())
    }

    pub fn build(defs: &Definitions, languages: &[&str]) -> Result<Self> {
        let mut encoders = HashMap::new();
        for name in languages {
            let def = defs
                .get(name)
                .ok_or_else(|| Error::BuildFailed(format!("unknown language {name}")))?;
            encoders.insert(name.to_string(), RegexEncoder::new(name, def)?);
        }
        Ok(Self { encoders })
    }

    pub fn get(&self, language: &str) -> Result<RegexEncoder> {
        self.encoders
            .get(language)
            .cloned()
            .ok_or_else(|| Error::BuildFailed(format!("unknown language {language}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::load_definitions;
    use num_traits::One;
    use pretty_assertions::assert_eq;

    #[test]
    fn encoded_strings_have_the_template_length() {
        let defs = load_definitions();
        let enc = RegexEncoder::new("ftp-request", defs.get("ftp-request").unwrap()).unwrap();
        for bits in [0usize, 1, 7, enc.capacity() - 1] {
            let payload = BigUint::one() << bits;
            let covertext = enc.encode(&payload).unwrap();
            assert_eq!(covertext.len(), enc.template_len());
            assert_eq!(enc.decode(&covertext).unwrap(), payload);
        }
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let defs = load_definitions();
        let enc = RegexEncoder::new("ftp-request", defs.get("ftp-request").unwrap()).unwrap();
        let too_big = BigUint::one() << enc.capacity();
        assert!(matches!(enc.encode(&too_big), Err(Error::OutOfRange)));
    }

    #[test]
    fn registry_serves_clones_of_one_build() {
        let defs = load_definitions();
        let registry = EncoderRegistry::build(defs, &["ftp-request"]).unwrap();
        let a = registry.get("ftp-request").unwrap();
        let b = registry.get("ftp-request").unwrap();
        assert_eq!(a.capacity(), b.capacity());
        assert!(registry.get("nope").is_err());
    }
}
