//! Regex-language definitions: `name -> (pattern, fixed_slice)`.
//!
//! A release ships as a JSON document tagged with a `YYYYMMDD` release
//! string. The default set is embedded in the binary; a file with the same
//! shape can be supplied through the configuration to replace it.
use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Deserialize;

pub const REQUEST_SUFFIX: &str = "-request";
pub const RESPONSE_SUFFIX: &str = "-response";

/// One named language: an extended-regex pattern plus the fixed string
/// length the codec ranks over.
#[derive(Debug, Clone, Deserialize)]
pub struct LanguageDef {
    pub regex: String,
    pub fixed_slice: usize,
}

/// A full release of language definitions.
#[derive(Debug, Clone, Deserialize)]
pub struct Definitions {
    release: String,
    languages: HashMap<String, LanguageDef>,
}

impl Definitions {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let defs: Definitions = serde_json::from_str(raw)?;
        anyhow::ensure!(defs.release.len() == 8, "release tag must be YYYYMMDD");
        Ok(defs)
    }

    /// The `YYYYMMDD` tag carried in every negotiation cell.
    pub fn release(&self) -> &str {
        &self.release
    }

    pub fn get(&self, name: &str) -> Option<&LanguageDef> {
        self.languages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.languages.contains_key(name)
    }

    /// All `*-request` language names, sorted so server-side trial decoding
    /// is deterministic.
    pub fn request_languages(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .languages
            .keys()
            .map(String::as_str)
            .filter(|n| n.ends_with(REQUEST_SUFFIX))
            .collect();
        names.sort_unstable();
        names
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

static EMBEDDED: Lazy<Definitions> = Lazy::new(|| {
    Definitions::from_json(include_str!("defs.json")).expect("embedded definitions are well-formed")
});

/// The definitions built into the binary.
pub fn load_definitions() -> &'static Definitions {
    &EMBEDDED
}

/// Strip the `-request` suffix, yielding the base name sent in negotiation.
pub fn base_name(language: &str) -> &str {
    language.strip_suffix(REQUEST_SUFFIX).unwrap_or(language)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn embedded_definitions_pair_up() {
        let defs = load_definitions();
        assert_eq!(defs.release().len(), 8);
        for name in defs.request_languages() {
            let partner = format!("{}{}", base_name(name), RESPONSE_SUFFIX);
            assert!(defs.contains(&partner), "missing response pair for {name}");
        }
    }

    #[test]
    fn request_languages_are_sorted() {
        let defs = load_definitions();
        let names = defs.request_languages();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }
}
