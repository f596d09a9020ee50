//! Unit tests for the NDJSON line codec.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use agent_conduit::transport::codec::{Frame, NdjsonCodec, MAX_LINE_BYTES};

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Complete lines decode one at a time; a partial line waits for more input.
#[test]
fn decodes_complete_lines_and_buffers_partial() {
    let mut codec = NdjsonCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\n{\"b\":");

    let first = codec.decode(&mut buf).expect("decode");
    assert_eq!(first, Some(Frame::Line("{\"a\":1}".into())));
    assert_eq!(codec.decode(&mut buf).expect("decode"), None, "partial line buffered");

    buf.extend_from_slice(b"2}\n");
    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some(Frame::Line("{\"b\":2}".into()))
    );
}

/// A carriage return before the newline is stripped.
#[test]
fn strips_crlf() {
    let mut codec = NdjsonCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\r\n");
    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some(Frame::Line("{\"a\":1}".into()))
    );
}

/// A final line without a terminator is delivered at EOF.
#[test]
fn decode_eof_yields_unterminated_line() {
    let mut codec = NdjsonCodec::new();
    let mut buf = BytesMut::from("{\"tail\":true}");
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    assert_eq!(
        codec.decode_eof(&mut buf).expect("decode_eof"),
        Some(Frame::Line("{\"tail\":true}".into()))
    );
}

/// An oversized line is reported once and decoding resumes after it.
#[test]
fn oversized_line_is_skipped_and_decoding_resumes() {
    let mut codec = NdjsonCodec::with_max_line_bytes(16);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[b'x'; 64]);
    buf.extend_from_slice(b"\n{\"ok\":1}\n");

    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some(Frame::Oversized { limit: 16 })
    );

    let mut next = codec.decode(&mut buf).expect("decode");
    while next.is_none() && !buf.is_empty() {
        next = codec.decode(&mut buf).expect("decode");
    }
    assert_eq!(next, Some(Frame::Line("{\"ok\":1}".into())));
}

/// The default limit is 1 MiB.
#[test]
fn default_limit_is_one_mebibyte() {
    assert_eq!(MAX_LINE_BYTES, 1024 * 1024);
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Encoding appends exactly one newline.
#[test]
fn encode_appends_newline() {
    let mut codec = NdjsonCodec::new();
    let mut dst = BytesMut::new();
    codec
        .encode("{\"type\":\"user\"}".to_owned(), &mut dst)
        .expect("encode");
    assert_eq!(&dst[..], b"{\"type\":\"user\"}\n");
}
