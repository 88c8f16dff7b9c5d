//! Allow-listed OCR languages.
//!
//! The OCR engine receives its language as a command-line argument. The only
//! way to obtain an [`OcrLanguage`] is a lookup in the fixed table below, so
//! an unvalidated string can never reach the engine.

use crate::error::SanitizeError;
use once_cell::sync::Lazy;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Display name → engine language code.
pub static OCR_LANGUAGES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("Afrikaans", "afr"),
        ("Arabic", "ara"),
        ("Basque", "eus"),
        ("Bengali", "ben"),
        ("Bulgarian", "bul"),
        ("Catalan", "cat"),
        ("Chinese - Simplified", "chi_sim"),
        ("Chinese - Traditional", "chi_tra"),
        ("Croatian", "hrv"),
        ("Czech", "ces"),
        ("Danish", "dan"),
        ("Dutch", "nld"),
        ("English", "eng"),
        ("Estonian", "est"),
        ("Finnish", "fin"),
        ("French", "fra"),
        ("Galician", "glg"),
        ("German", "deu"),
        ("Greek", "ell"),
        ("Hebrew", "heb"),
        ("Hindi", "hin"),
        ("Hungarian", "hun"),
        ("Icelandic", "isl"),
        ("Indonesian", "ind"),
        ("Irish", "gle"),
        ("Italian", "ita"),
        ("Japanese", "jpn"),
        ("Korean", "kor"),
        ("Latvian", "lav"),
        ("Lithuanian", "lit"),
        ("Malay", "msa"),
        ("Norwegian", "nor"),
        ("Persian", "fas"),
        ("Polish", "pol"),
        ("Portuguese", "por"),
        ("Romanian", "ron"),
        ("Russian", "rus"),
        ("Serbian", "srp"),
        ("Slovak", "slk"),
        ("Slovenian", "slv"),
        ("Spanish", "spa"),
        ("Swahili", "swa"),
        ("Swedish", "swe"),
        ("Tagalog", "tgl"),
        ("Tamil", "tam"),
        ("Telugu", "tel"),
        ("Thai", "tha"),
        ("Turkish", "tur"),
        ("Ukrainian", "ukr"),
        ("Urdu", "urd"),
        ("Vietnamese", "vie"),
        ("Welsh", "cym"),
    ])
});

/// A language code taken from [`OCR_LANGUAGES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OcrLanguage(&'static str);

impl OcrLanguage {
    /// Look up a language by engine code (`"eng"`) or display name
    /// (`"English"`, case-insensitive).
    pub fn lookup(value: &str) -> Option<Self> {
        let value = value.trim();
        OCR_LANGUAGES
            .iter()
            .find(|(name, code)| **code == value || name.eq_ignore_ascii_case(value))
            .map(|(_, code)| OcrLanguage(*code))
    }

    /// Like [`lookup`](Self::lookup), but reports an unknown value.
    pub fn parse(value: &str) -> Result<Self, SanitizeError> {
        Self::lookup(value).ok_or_else(|| {
            SanitizeError::InvalidConfig(format!("unsupported OCR language '{}'", value.trim()))
        })
    }

    pub fn code(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for OcrLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Serialize for OcrLanguage {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.0)
    }
}
