use std::io::Read;

use hyper::body::Bytes;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::{Body, HeaderMap, Response};
use tracing::warn;

use crate::error::RelayError;
use crate::tokens::{TokenParser, TokenUsage};

/// Result of reading, decoding and analyzing a buffered upstream response.
#[derive(Debug)]
pub struct BufferedOutcome {
    pub status: u16,
    /// Upstream headers with encoding/length removed (the body below is
    /// already decoded; hyper recomputes the length)
    pub headers: HeaderMap,
    pub body: Bytes,
    pub analysis: BodyAnalysis,
}

/// What the response body carried, token-wise.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyAnalysis {
    Tokens {
        usage: TokenUsage,
        model: Option<String>,
    },
    ApiError {
        error_type: String,
        message: String,
    },
    NonToken,
}

/// Buffered (non-SSE) forwarding path: read the whole response, undo any
/// content encoding, and extract usage from the body.
pub struct BufferedPipeline;

impl BufferedPipeline {
    pub async fn process(response: Response<Body>) -> Result<BufferedOutcome, RelayError> {
        let (parts, body) = response.into_parts();
        let raw = hyper::body::to_bytes(body).await.map_err(RelayError::from)?;

        let encoding = parts
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("identity")
            .trim()
            .to_ascii_lowercase();

        let body = decode_body(&encoding, raw)?;

        let mut headers = parts.headers;
        headers.remove(CONTENT_ENCODING);
        headers.remove(CONTENT_LENGTH);

        let analysis = analyze_body(&body);

        Ok(BufferedOutcome {
            status: parts.status.as_u16(),
            headers,
            body,
            analysis,
        })
    }
}

/// Undo the upstream `Content-Encoding`. Unknown encodings (including the
/// ancient LZW `compress`) pass through untouched with a warning.
fn decode_body(encoding: &str, raw: Bytes) -> Result<Bytes, RelayError> {
    match encoding {
        "" | "identity" => Ok(raw),
        "gzip" | "x-gzip" => {
            let mut decoded = Vec::new();
            flate2::read::GzDecoder::new(raw.as_ref())
                .read_to_end(&mut decoded)
                .map_err(|e| RelayError::Parsing(format!("gzip decode failed: {e}")))?;
            Ok(Bytes::from(decoded))
        }
        "deflate" => {
            // HTTP deflate is usually zlib-wrapped; some servers send raw
            // deflate streams, so fall back before giving up
            let mut decoded = Vec::new();
            if flate2::read::ZlibDecoder::new(raw.as_ref())
                .read_to_end(&mut decoded)
                .is_ok()
            {
                return Ok(Bytes::from(decoded));
            }
            decoded.clear();
            flate2::read::DeflateDecoder::new(raw.as_ref())
                .read_to_end(&mut decoded)
                .map_err(|e| RelayError::Parsing(format!("deflate decode failed: {e}")))?;
            Ok(Bytes::from(decoded))
        }
        "br" => {
            let mut decoded = Vec::new();
            brotli::Decompressor::new(raw.as_ref(), 4096)
                .read_to_end(&mut decoded)
                .map_err(|e| RelayError::Parsing(format!("brotli decode failed: {e}")))?;
            Ok(Bytes::from(decoded))
        }
        other => {
            warn!("Unsupported Content-Encoding '{other}', passing body through");
            Ok(raw)
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct JsonResponseBody {
    model: Option<String>,
    usage: Option<TokenUsage>,
    error: Option<JsonErrorBody>,
}

#[derive(Debug, serde::Deserialize)]
struct JsonErrorBody {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
}

/// Extract usage from a decoded body: SSE transcripts are replayed through
/// the token parser, JSON bodies are checked for `usage`/`error` fields,
/// anything else is a non-token response.
fn analyze_body(body: &[u8]) -> BodyAnalysis {
    if looks_like_sse(body) {
        let mut parser = TokenParser::new();
        parser.feed(body);
        parser.flush_pending_event();
        if let Some((error_type, message)) = parser.api_error() {
            return BodyAnalysis::ApiError {
                error_type: error_type.clone(),
                message: message.clone(),
            };
        }
        if let Some(usage) = parser.final_usage() {
            return BodyAnalysis::Tokens {
                usage,
                model: parser.model().map(str::to_string),
            };
        }
        return BodyAnalysis::NonToken;
    }

    match serde_json::from_slice::<JsonResponseBody>(body) {
        Ok(parsed) => {
            if let Some(error) = parsed.error {
                return BodyAnalysis::ApiError {
                    error_type: error.error_type.unwrap_or_else(|| "unknown".to_string()),
                    message: error.message.unwrap_or_else(|| "unknown".to_string()),
                };
            }
            if let Some(usage) = parsed.usage {
                return BodyAnalysis::Tokens {
                    usage,
                    model: parsed.model,
                };
            }
            BodyAnalysis::NonToken
        }
        Err(_) => BodyAnalysis::NonToken,
    }
}

fn looks_like_sse(body: &[u8]) -> bool {
    let head = &body[..body.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start();
    trimmed.starts_with("event:") || trimmed.starts_with("data:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    fn zlib(data: &[u8]) -> Bytes {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    fn br(data: &[u8]) -> Bytes {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(data).unwrap();
        }
        Bytes::from(out)
    }

    const USAGE_BODY: &[u8] = br#"{"model":"claude-3-5-sonnet-20241022","usage":{"input_tokens":12,"output_tokens":34,"cache_creation_input_tokens":0,"cache_read_input_tokens":5}}"#;

    #[test]
    fn test_decode_identity_and_unknown_pass_through() {
        let raw = Bytes::from_static(b"hello");
        assert_eq!(decode_body("identity", raw.clone()).unwrap(), raw);
        assert_eq!(decode_body("", raw.clone()).unwrap(), raw);
        assert_eq!(decode_body("compress", raw.clone()).unwrap(), raw);
        assert_eq!(decode_body("zstd", raw.clone()).unwrap(), raw);
    }

    #[test]
    fn test_decode_gzip() {
        let decoded = decode_body("gzip", gzip(USAGE_BODY)).unwrap();
        assert_eq!(decoded.as_ref(), USAGE_BODY);
    }

    #[test]
    fn test_decode_deflate_zlib_wrapped() {
        let decoded = decode_body("deflate", zlib(USAGE_BODY)).unwrap();
        assert_eq!(decoded.as_ref(), USAGE_BODY);
    }

    #[test]
    fn test_decode_brotli() {
        let decoded = decode_body("br", br(USAGE_BODY)).unwrap();
        assert_eq!(decoded.as_ref(), USAGE_BODY);
    }

    #[test]
    fn test_corrupt_gzip_is_a_parse_error() {
        let result = decode_body("gzip", Bytes::from_static(b"not gzip at all"));
        assert!(matches!(result, Err(RelayError::Parsing(_))));
    }

    #[test]
    fn test_analyze_json_usage() {
        match analyze_body(USAGE_BODY) {
            BodyAnalysis::Tokens { usage, model } => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 34);
                assert_eq!(usage.cache_read_input_tokens, 5);
                assert_eq!(model.as_deref(), Some("claude-3-5-sonnet-20241022"));
            }
            other => panic!("unexpected analysis: {other:?}"),
        }
    }

    #[test]
    fn test_analyze_json_error() {
        let body = br#"{"error":{"type":"invalid_request_error","message":"bad field"}}"#;
        match analyze_body(body) {
            BodyAnalysis::ApiError {
                error_type,
                message,
            } => {
                assert_eq!(error_type, "invalid_request_error");
                assert_eq!(message, "bad field");
            }
            other => panic!("unexpected analysis: {other:?}"),
        }
    }

    #[test]
    fn test_analyze_sse_transcript() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"message\":{\"model\":\"claude-3-5-haiku-20241022\"}}\n\n",
            "event: message_delta\n",
            "data: {\"usage\":{\"input_tokens\":7,\"output_tokens\":11}}\n\n",
        );
        match analyze_body(body.as_bytes()) {
            BodyAnalysis::Tokens { usage, model } => {
                assert_eq!(usage.input_tokens, 7);
                assert_eq!(usage.output_tokens, 11);
                assert_eq!(model.as_deref(), Some("claude-3-5-haiku-20241022"));
            }
            other => panic!("unexpected analysis: {other:?}"),
        }
    }

    #[test]
    fn test_analyze_plain_text_is_non_token() {
        assert_eq!(analyze_body(b"hello world"), BodyAnalysis::NonToken);
        assert_eq!(analyze_body(br#"{"ok":true}"#), BodyAnalysis::NonToken);
    }

    #[tokio::test]
    async fn test_process_strips_encoding_headers() {
        let response = Response::builder()
            .status(200)
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_LENGTH, gzip(USAGE_BODY).len())
            .header("x-request-id", "abc")
            .body(Body::from(gzip(USAGE_BODY)))
            .unwrap();

        let outcome = BufferedPipeline::process(response).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert!(outcome.headers.get(CONTENT_ENCODING).is_none());
        assert!(outcome.headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(outcome.headers.get("x-request-id").unwrap(), "abc");
        assert_eq!(outcome.body.as_ref(), USAGE_BODY);
        assert!(matches!(outcome.analysis, BodyAnalysis::Tokens { .. }));
    }
}
