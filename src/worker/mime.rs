//! Content sniffing: decide how to turn an untrusted file into a PDF.
//!
//! Only the leading bytes of the file are looked at, never its name. The
//! result is a MIME type, which is then looked up in a fixed table. Anything
//! not in the table is refused with [`ConversionError::DocFormatUnsupported`].

use crate::error::ConversionError;

/// How many leading bytes [`sniff`] needs to see.
pub const SNIFF_LEN: usize = 64 * 1024;

/// How a document gets to PDF before rasterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPath {
    /// Already a PDF.
    NativePdf,
    /// Converted by LibreOffice in headless safe mode.
    OfficeSuite,
    /// Converted by GraphicsMagick.
    RasterTool,
}

const OLE2_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const HWP_SIGNATURE: &[u8] = b"HWP Document File";

const HWP_MIME: &str = "application/vnd.hancom.hwp";
const HWPX_MIME: &str = "application/vnd.hancom.hwpx";

const CONVERSION_TABLE: &[(&str, ConversionPath)] = &[
    ("application/pdf", ConversionPath::NativePdf),
    // Microsoft Office
    ("application/msword", ConversionPath::OfficeSuite),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ConversionPath::OfficeSuite,
    ),
    ("application/vnd.ms-word.document.macroEnabled.12", ConversionPath::OfficeSuite),
    ("application/vnd.ms-excel", ConversionPath::OfficeSuite),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ConversionPath::OfficeSuite,
    ),
    ("application/vnd.ms-powerpoint", ConversionPath::OfficeSuite),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        ConversionPath::OfficeSuite,
    ),
    // LibreOffice
    ("application/vnd.oasis.opendocument.text", ConversionPath::OfficeSuite),
    ("application/vnd.oasis.opendocument.text-template", ConversionPath::OfficeSuite),
    ("application/vnd.oasis.opendocument.spreadsheet", ConversionPath::OfficeSuite),
    ("application/vnd.oasis.opendocument.spreadsheet-template", ConversionPath::OfficeSuite),
    ("application/vnd.oasis.opendocument.presentation", ConversionPath::OfficeSuite),
    ("application/vnd.oasis.opendocument.presentation-template", ConversionPath::OfficeSuite),
    ("application/vnd.oasis.opendocument.graphics", ConversionPath::OfficeSuite),
    ("application/vnd.oasis.opendocument.graphics-template", ConversionPath::OfficeSuite),
    // Hancom Office
    (HWP_MIME, ConversionPath::OfficeSuite),
    (HWPX_MIME, ConversionPath::OfficeSuite),
    // Containers libmagic-style detection cannot look into
    ("application/x-ole-storage", ConversionPath::OfficeSuite),
    ("application/zip", ConversionPath::OfficeSuite),
    ("application/octet-stream", ConversionPath::OfficeSuite),
    // Images
    ("image/jpeg", ConversionPath::RasterTool),
    ("image/gif", ConversionPath::RasterTool),
    ("image/png", ConversionPath::RasterTool),
    ("image/tiff", ConversionPath::RasterTool),
];

/// Look a MIME type up in the conversion table.
pub fn conversion_path(mime: &str) -> Option<ConversionPath> {
    CONVERSION_TABLE
        .iter()
        .find(|(m, _)| *m == mime)
        .map(|(_, path)| *path)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// MIME type of a ZIP container, from its first entries.
fn sniff_zip(head: &[u8]) -> String {
    // ODF and HWPX store an uncompressed `mimetype` entry first.
    if head.len() >= 30 {
        let name_len = usize::from(u16::from_le_bytes([head[26], head[27]]));
        let extra_len = usize::from(u16::from_le_bytes([head[28], head[29]]));
        let name = head.get(30..30 + name_len);
        if name == Some(b"mimetype".as_slice()) {
            let start = 30 + name_len + extra_len;
            let size = u32::from_le_bytes([head[18], head[19], head[20], head[21]]) as usize;
            if let Some(body) = head.get(start..start + size.min(128)) {
                let declared = String::from_utf8_lossy(body);
                if declared == "application/hwp+zip" {
                    return HWPX_MIME.to_string();
                }
                if declared.starts_with("application/vnd.oasis.opendocument.") {
                    return declared.into_owned();
                }
            }
        }
    }

    if contains(head, b"[Content_Types].xml") {
        if contains(head, b"word/") {
            return "application/vnd.openxmlformats-officedocument.wordprocessingml.document".into();
        }
        if contains(head, b"xl/") {
            return "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".into();
        }
        if contains(head, b"ppt/") {
            return "application/vnd.openxmlformats-officedocument.presentationml.presentation"
                .into();
        }
    }
    "application/zip".into()
}

fn looks_like_text(head: &[u8]) -> bool {
    !head.contains(&0)
        && match std::str::from_utf8(head) {
            Ok(_) => true,
            // A multi-byte character cut at the end of the sniffed window.
            Err(e) => e.error_len().is_none(),
        }
}

/// Guess the MIME type of a file from its leading bytes.
pub fn sniff(head: &[u8]) -> String {
    if head.is_empty() {
        return "application/x-empty".into();
    }
    if head.starts_with(b"%PDF") {
        return "application/pdf".into();
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg".into();
    }
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png".into();
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return "image/gif".into();
    }
    if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
        return "image/tiff".into();
    }
    if head.starts_with(OLE2_MAGIC) {
        if contains(head, HWP_SIGNATURE) {
            return HWP_MIME.into();
        }
        return "application/x-ole-storage".into();
    }
    if head.starts_with(ZIP_MAGIC) {
        return sniff_zip(head);
    }
    if head.starts_with(b"{\\rtf") {
        return "text/rtf".into();
    }
    if looks_like_text(head) {
        return "text/plain".into();
    }
    "application/octet-stream".into()
}

/// Sniff `head` and resolve its conversion path.
///
/// Hancom formats are refused inside a disposable VM, whose template ships
/// without the import filter.
pub fn classify(head: &[u8], on_qubes: bool) -> Result<(String, ConversionPath), ConversionError> {
    let mime = sniff(head);
    let path = conversion_path(&mime).ok_or(ConversionError::DocFormatUnsupported)?;
    if on_qubes && (mime == HWP_MIME || mime == HWPX_MIME) {
        return Err(ConversionError::DocFormatUnsupportedOnBackend);
    }
    Ok((mime, path))
}
