use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

/// Build a Content-Disposition attachment header with an ASCII fallback and
/// an RFC 5987 extended name when the filename needs one.
pub fn build_content_disposition_header(filename: &str) -> HeaderValue {
    let mut fallback = String::with_capacity(filename.len());
    let mut contains_non_ascii = false;

    for ch in filename.chars() {
        if matches!(ch, ' '..='~') && ch != '"' && ch != '\\' {
            fallback.push(ch);
        } else {
            contains_non_ascii |= !ch.is_ascii();
            fallback.push('_');
        }
    }

    if fallback.is_empty() {
        fallback.push_str("download.bin");
    }

    let header_value = if contains_non_ascii {
        let encoded = encode_filename_for_rfc5987(filename);
        format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
    } else {
        format!("attachment; filename=\"{fallback}\"")
    };

    HeaderValue::from_str(&header_value).unwrap_or(HeaderValue::from_static("attachment"))
}

/// Percent-encode a filename for RFC 5987 usage.
pub fn encode_filename_for_rfc5987(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());

    for byte in input.as_bytes() {
        match *byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'!'
            | b'#'
            | b'$'
            | b'&'
            | b'+'
            | b'-'
            | b'.'
            | b'^'
            | b'_'
            | b'`'
            | b'|'
            | b'~' => encoded.push(*byte as char),
            _ => {
                encoded.push('%');
                encoded.push_str(&format!("{:02X}", byte));
            }
        }
    }

    encoded
}

/// Canonical application server error response body.
pub fn server_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Unable to process your request. Please try again later.",
    )
        .into_response()
}

/// Shared response for codes with nothing behind them. Also used when the
/// presented key does not match, so a guess learns nothing extra.
pub fn entry_not_found_response() -> Response {
    (
        StatusCode::NOT_FOUND,
        "We couldn't find an entry for that code. Double-check the code and try again.",
    )
        .into_response()
}
