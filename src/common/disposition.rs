use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left untouched when percent-encoding filenames, both in the
/// RFC 6266 `filename*` parameter and in object-store metadata values.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Percent-encodes a filename as UTF-8.
pub fn percent_encode_filename(filename: &str) -> String {
    utf8_percent_encode(filename, FILENAME_ENCODE_SET).to_string()
}

/// Decodes a percent-encoded filename, replacing invalid sequences.
pub fn percent_decode_filename(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// ASCII-only rendition of a filename for the plain `filename` parameter.
/// ASCII characters pass through, anything else is percent-encoded so the
/// value stays a single header token.
fn ascii_fallback(filename: &str) -> String {
    let mut out = String::with_capacity(filename.len());
    for c in filename.chars() {
        if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            out.push_str(&percent_encode_filename(c.encode_utf8(&mut buf)));
        }
    }
    out
}

/// Builds the RFC 6266 composite Content-Disposition value: an ASCII
/// fallback plus the UTF-8 `filename*` form.
pub fn make_content_disposition(disposition: &str, filename: &str) -> String {
    format!(
        "{}; filename=\"{}\"; filename*=utf-8''{}",
        disposition,
        ascii_fallback(filename),
        percent_encode_filename(filename)
    )
}
