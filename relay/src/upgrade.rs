//! Upgrade ingress (spec §4.5, component C5): WebSocket and other
//! `Connection: Upgrade` requests need the caller's raw duplex handed off
//! to the upstream once the switch is confirmed, rather than a single
//! buffered request/response round trip.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use tracing::warn;

use rtunnel_shared::protocol::{ControlMessage, Ticket};

use crate::control::TunnelStream;
use crate::error::RelayError;
use crate::hostname;
use crate::RelayState;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// True if this request is asking to switch protocols and therefore needs
/// [`forward_upgrade`] instead of the ordinary buffered path.
pub fn wants_upgrade(req: &Request<Body>) -> bool {
    req.headers()
        .get(axum::http::header::UPGRADE)
        .is_some()
}

pub async fn forward_upgrade(
    State(state): State<RelayState>,
    mut req: Request<Body>,
) -> Result<Response<Body>, RelayError> {
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

    let on_upgrade = hyper::upgrade::on(&mut req);

    let head = encode_head(&req);
    stream.write_all(&head).await?;
    stream.write_eof().await?;

    let head_result = read_response_head(&mut stream).await;

    let (status, headers, leftover) = match head_result {
        Ok(parts) => parts,
        Err(err) => {
            client.forget_stream(&ticket);
            return Err(err);
        }
    };

    let mut builder = Response::builder().status(status);
    let is_switching = status == StatusCode::SWITCHING_PROTOCOLS && headers_have_upgrade(&headers);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    if is_switching {
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => bridge(hyper_util::rt::TokioIo::new(upgraded), stream, leftover).await,
                Err(err) => warn!(%err, "caller never completed the protocol switch"),
            }
            client.forget_stream(&ticket);
        });
        builder
            .body(Body::empty())
            .map_err(|err| RelayError::Transport(err.to_string()))
    } else {
        // Upstream declined to switch protocols; read the rest of its
        // response body as an ordinary reply.
        let mut body = leftover;
        let rest = stream.read_to_end().await;
        client.forget_stream(&ticket);
        body.extend_from_slice(&rest?);
        builder
            .body(Body::from(body))
            .map_err(|err| RelayError::Transport(err.to_string()))
    }
}

fn headers_have_upgrade(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("upgrade"))
}

fn encode_head(req: &Request<Body>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    buf.extend_from_slice(
        format!("{} {} {:?}\r\n", req.method(), path_and_query, req.version()).as_bytes(),
    );
    for (name, value) in req.headers().iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Reads chunks off `stream` until a full response head (status line +
/// headers + blank line) has arrived, parses it, and returns whatever
/// bytes were read past the blank line alongside it — those belong to the
/// body/bridge, not the head.
async fn read_response_head(
    stream: &mut TunnelStream,
) -> Result<(StatusCode, Vec<(String, String)>, Vec<u8>), RelayError> {
    let mut buf = Vec::new();
    loop {
        let mut raw_headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut raw_headers);
        let parsed = response
            .parse(&buf)
            .map_err(|err| RelayError::Transport(format!("malformed upstream response: {err}")))?;

        if let httparse::Status::Complete(len) = parsed {
            let status = StatusCode::from_u16(response.code.unwrap_or(502))
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let headers = response
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            return Ok((status, headers, buf[len..].to_vec()));
        }

        match stream.read_chunk().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => {
                return Err(RelayError::Transport(
                    "upstream closed before sending a complete response head".into(),
                ))
            }
        }
    }
}

/// Shuttles bytes between the caller's now-upgraded raw duplex and the
/// tunnel stream until either side closes. `TunnelStream` exposes manual
/// async methods rather than `AsyncRead`/`AsyncWrite`, so this is a
/// hand-rolled `select!` loop instead of `tokio::io::copy_bidirectional`.
/// `hyper::upgrade::Upgraded` only implements hyper's own `rt::Read`/
/// `rt::Write`, not tokio's; the caller wraps it in `hyper_util::rt::TokioIo`
/// so it can be driven with `tokio::io::{AsyncReadExt, AsyncWriteExt}` here.
async fn bridge(
    mut upgraded: hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>,
    mut stream: TunnelStream,
    leftover: Vec<u8>,
) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    if !leftover.is_empty() && upgraded.write_all(&leftover).await.is_err() {
        return;
    }

    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            read = upgraded.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        let _ = stream.write_eof().await;
                        break;
                    }
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            chunk = stream.read_chunk() => {
                match chunk {
                    Ok(Some(data)) => {
                        if upgraded.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}
