// op-protocol: Tunnel control-channel frame types and serialization.
//
// All control-channel messages use a top-level `type` field for
// discriminated deserialization.  One frame = one text message on the
// underlying transport; body bytes travel base64-encoded so every field
// stays ASCII-safe regardless of the transport's framing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header map as carried on the wire: lowercase-insensitive names, one value
/// per name (the edge's HTTP layer folds repeated headers before framing).
pub type Headers = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Which body stream a `chunk` / `end` frame belongs to.
///
/// Absent on the wire means [`Direction::Response`]; the edge tags its
/// outbound request-body frames with `request` so a single channel can carry
/// both streams for the same request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

// ---------------------------------------------------------------------------
// Client -> Edge messages
// ---------------------------------------------------------------------------

/// Declare tunnel presence.  Sent once, as the first frame after connecting.
///
/// `port` is the loopback port the client dispatches against; the edge uses
/// it for status reporting only, never for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub port: u16,
}

/// Begin a response for the request `id`.
///
/// Exactly one `response` frame per id, and it must precede any
/// response-direction `chunk`.  `body`, when present, is an inline base64
/// payload; `streaming = true` announces that chunks and an `end` follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub id: String,
    pub status: u16,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

impl ResponseHead {
    pub fn is_streaming(&self) -> bool {
        self.streaming.unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Edge -> Client messages
// ---------------------------------------------------------------------------

/// Acknowledge a registration (echoes the declared port).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registered {
    pub port: u16,
}

/// Begin an inbound public request.
///
/// `url` is origin-form (path plus query).  When `hasBody` is true the body
/// follows as request-direction chunks terminated by an `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub id: String,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    #[serde(rename = "hasBody")]
    pub has_body: bool,
}

// ---------------------------------------------------------------------------
// Bidirectional messages
// ---------------------------------------------------------------------------

/// One body fragment.  `data` is base64-encoded raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyChunk {
    pub id: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl BodyChunk {
    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or(Direction::Response)
    }
}

/// Terminates a body stream for `id`; same direction convention as `chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyEnd {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl BodyEnd {
    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or(Direction::Response)
    }
}

/// Out-of-band notification.  Not tied to a request id; advisory only —
/// receivers log it and carry on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All frame kinds on the control channel.
///
/// Serializes/deserializes using the `type` field as a tag.
///
/// ```json
/// { "type": "request", "id": "...", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    Register(Register),
    Registered(Registered),
    Request(RequestHead),
    Chunk(BodyChunk),
    End(BodyEnd),
    Response(ResponseHead),
    Error(ErrorNotice),
}

impl Frame {
    /// The request id this frame is routed by, if it carries one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::Request(f) => Some(&f.id),
            Frame::Chunk(f) => Some(&f.id),
            Frame::End(f) => Some(&f.id),
            Frame::Response(f) => Some(&f.id),
            Frame::Register(_) | Frame::Registered(_) | Frame::Error(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Body payload encoding
// ---------------------------------------------------------------------------

/// Base64 helpers for the `data` / `body` frame fields.
pub mod body {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(data)
    }
}

// ---------------------------------------------------------------------------
// Header sanitization
// ---------------------------------------------------------------------------

/// Hop-by-hop header handling.
///
/// HTTP/1.1 hop-by-hop headers describe a single connection and must not
/// cross the tunnel; both peers strip them before framing.
pub mod headers {
    use super::Headers;

    pub const HOP_BY_HOP: [&str; 8] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];

    pub fn is_hop_by_hop(name: &str) -> bool {
        HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
    }

    /// Copy `headers` minus the hop-by-hop set.
    pub fn sanitize(headers: &Headers) -> Headers {
        headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_defaults_to_response() {
        let chunk = BodyChunk {
            id: "r1".to_owned(),
            data: body::encode(b"x"),
            direction: None,
        };
        assert_eq!(chunk.direction(), Direction::Response);

        let end = BodyEnd {
            id: "r1".to_owned(),
            direction: Some(Direction::Request),
        };
        assert_eq!(end.direction(), Direction::Request);
    }

    #[test]
    fn body_round_trips_raw_bytes() {
        let raw: Vec<u8> = (0u8..=255).collect();
        let encoded = body::encode(&raw);
        assert_eq!(body::decode(&encoded).unwrap(), raw);
    }

    #[test]
    fn sanitize_strips_hop_by_hop_case_insensitively() {
        let mut h = Headers::new();
        h.insert("Connection".to_owned(), "keep-alive".to_owned());
        h.insert("TE".to_owned(), "trailers".to_owned());
        h.insert("Transfer-Encoding".to_owned(), "chunked".to_owned());
        h.insert("content-type".to_owned(), "text/plain".to_owned());
        h.insert("x-custom".to_owned(), "1".to_owned());

        let clean = headers::sanitize(&h);
        assert_eq!(clean.len(), 2);
        assert!(clean.contains_key("content-type"));
        assert!(clean.contains_key("x-custom"));
        for name in clean.keys() {
            assert!(!headers::is_hop_by_hop(name));
        }
    }

    #[test]
    fn request_id_extraction() {
        let frame = Frame::Response(ResponseHead {
            id: "abc".to_owned(),
            status: 200,
            headers: Headers::new(),
            body: None,
            streaming: None,
        });
        assert_eq!(frame.request_id(), Some("abc"));

        let frame = Frame::Register(Register { port: 3000 });
        assert_eq!(frame.request_id(), None);
    }
}
