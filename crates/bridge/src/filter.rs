//! Terminal control-sequence filtering.
//!
//! Shell output carries ANSI/VT escape sequences (cursor movement, color,
//! character-set switches) that a plain-text client cannot interpret. This
//! module strips the recognized sequences from each output chunk before it
//! is forwarded.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

/// Recognized escape sequences: CSI sequences, character-set selection,
/// and keypad mode toggles.
static CONTROL_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]|\x1B[()][AB012]|\x1B=|\x1B>")
        .expect("control sequence pattern is valid")
});

/// Removes recognized terminal control sequences from `text`.
///
/// Pure and stateless: each chunk is filtered independently. A sequence
/// that straddles a chunk boundary may pass through unfiltered; that is an
/// accepted approximation, and the filter does not buffer across chunks.
pub fn strip_control_sequences(text: &str) -> Cow<'_, str> {
    CONTROL_SEQUENCE.replace_all(text, "")
}
