//! Neutralising untrusted text before it reaches a terminal or a log.
//!
//! Anything that crossed the sandbox boundary as text (worker progress
//! lines, captured stderr) and anything derived from a user-supplied path
//! goes through [`replace_control_chars`]. Control, format, line/paragraph
//! separator, and private-use code points are replaced with U+FFFD so they
//! cannot drive terminal escapes or spoof bidi rendering.

const REPLACEMENT: char = '\u{FFFD}';

/// Format (`Cf`) code points that can alter how text renders.
const FORMAT_RANGES: &[(char, char)] = &[
    ('\u{00AD}', '\u{00AD}'),
    ('\u{0600}', '\u{0605}'),
    ('\u{061C}', '\u{061C}'),
    ('\u{06DD}', '\u{06DD}'),
    ('\u{070F}', '\u{070F}'),
    ('\u{180E}', '\u{180E}'),
    ('\u{200B}', '\u{200F}'),
    ('\u{202A}', '\u{202E}'),
    ('\u{2060}', '\u{2064}'),
    ('\u{2066}', '\u{206F}'),
    ('\u{FEFF}', '\u{FEFF}'),
    ('\u{FFF9}', '\u{FFFB}'),
    ('\u{E0001}', '\u{E0001}'),
    ('\u{E0020}', '\u{E007F}'),
];

/// Private-use (`Co`) planes and area.
const PRIVATE_USE_RANGES: &[(char, char)] = &[
    ('\u{E000}', '\u{F8FF}'),
    ('\u{F0000}', '\u{FFFFD}'),
    ('\u{100000}', '\u{10FFFD}'),
];

fn in_ranges(c: char, ranges: &[(char, char)]) -> bool {
    ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(&c))
}

/// Whether `c` must not be shown to a user as-is.
pub fn is_unsafe_char(c: char) -> bool {
    c.is_control()
        || c == '\u{2028}'
        || c == '\u{2029}'
        || in_ranges(c, FORMAT_RANGES)
        || in_ranges(c, PRIVATE_USE_RANGES)
}

/// Replace every unsafe code point in `text` with U+FFFD.
///
/// With `keep_newlines`, `\n` and `\r` survive so multi-line output keeps
/// its shape.
pub fn replace_control_chars(text: &str, keep_newlines: bool) -> String {
    text.chars()
        .map(|c| {
            if keep_newlines && (c == '\n' || c == '\r') {
                c
            } else if is_unsafe_char(c) {
                REPLACEMENT
            } else {
                c
            }
        })
        .collect()
}
