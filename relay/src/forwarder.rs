//! HTTP ingress / forwarder (spec §4.4, component C4).
//!
//! Turns one public HTTP request into bytes written onto a freshly
//! rendezvous'd [`TunnelStream`], then turns whatever comes back into the
//! public caller's response.

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use tracing::warn;

use rtunnel_shared::protocol::{ControlMessage, Ticket};

use crate::error::RelayError;
use crate::hostname;
use crate::RelayState;

/// Public requests may carry a body up to this size before being rejected
/// outright — matching the teacher's own `to_bytes` limit.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// How long the forwarder waits for the tunnel client to open the reply
/// stream and for the upstream's full response before giving up.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Catch-all handler for any request whose `Host` header does not address
/// the control channel route itself.
pub async fn forward(
    State(state): State<RelayState>,
    req: Request<Body>,
) -> Result<Response<Body>, RelayError> {
    let start = tokio::time::Instant::now();
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let name = hostname::resolve(host, &state.config.subdomain)?;

    let client = state
        .registry
        .lookup(&name)
        .ok_or_else(|| RelayError::Unregistered(name.clone()))?;

    let ticket = Ticket::new();
    let acceptor = client.once(ticket);

    if client
        .emit(ControlMessage::IncomingClient { ticket })
        .await
        .is_err()
    {
        client.cancel(&ticket);
        return Err(RelayError::Transport(
            "tunnel client connection closed".into(),
        ));
    }

    let mut stream = match tokio::time::timeout(REQUEST_TIMEOUT, acceptor).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) => {
            return Err(RelayError::Transport(
                "tunnel client never opened a reply stream".into(),
            ))
        }
        Err(_) => {
            client.cancel(&ticket);
            return Err(RelayError::Transport(
                "timed out waiting for tunnel client".into(),
            ));
        }
    };

    let result = serve_over(&mut stream, req).await;
    client.forget_stream(&ticket);

    let (body_len, reply_len, response) = result?;
    state
        .metrics
        .record_request(
            &name,
            response.status().as_u16(),
            start.elapsed().as_micros() as u64,
            body_len as u64,
            reply_len as u64,
        )
        .await;
    Ok(response)
}

async fn serve_over(
    stream: &mut crate::control::TunnelStream,
    req: Request<Body>,
) -> Result<(usize, usize, Response<Body>), RelayError> {
    let (parts, body) = req.into_parts();
    let body_bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| RelayError::Transport(err.to_string()))?;
    let body_len = body_bytes.len();
    let request_bytes = encode_request(&parts, &body_bytes);

    if let Err(err) = stream.write_all(&request_bytes).await {
        warn!(%err, "failed writing request onto tunnel stream");
        return Err(err);
    }
    if let Err(err) = stream.write_eof().await {
        warn!(%err, "failed half-closing tunnel stream after request");
        return Err(err);
    }

    let reply = tokio::time::timeout(REQUEST_TIMEOUT, stream.read_to_end())
        .await
        .map_err(|_| RelayError::Transport("timed out waiting for upstream reply".into()))??;

    let reply_len = reply.len();
    decode_response(&reply).map(|resp| (body_len, reply_len, resp))
}

/// Serializes a request the way spec §4.4 requires: the request line,
/// headers in their original order, a blank line, the body, and a
/// trailing CRLF.
fn encode_request(parts: &axum::http::request::Parts, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(body.len() + 256);

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    buf.extend_from_slice(
        format!("{} {} {:?}\r\n", parts.method, path_and_query, parts.version).as_bytes(),
    );

    for (name, value) in parts.headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Parses a raw HTTP response (status line + headers + blank line + body)
/// read back off a [`crate::control::TunnelStream`].
fn decode_response(bytes: &[u8]) -> Result<Response<Body>, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response
        .parse(bytes)
        .map_err(|err| RelayError::Transport(format!("malformed upstream response: {err}")))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            return Err(RelayError::Transport(
                "incomplete upstream response head".into(),
            ))
        }
    };

    let status = response.code.unwrap_or(502);
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for header in response.headers.iter() {
        if let Ok(value) = axum::http::HeaderValue::from_bytes(header.value) {
            builder = builder.header(header.name, value);
        }
    }

    let body = bytes[head_len..].to_vec();
    builder
        .body(Body::from(body))
        .map_err(|err| RelayError::Transport(err.to_string()))
}
