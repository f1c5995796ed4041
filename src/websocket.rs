//! WebSocket tunnelling for preview hosts (dev server hot reload and friends).
//!
//! The client handshake is accepted first and the upstream is resolved inside
//! the upgrade task. If resolution or the upstream handshake fails the client
//! socket is dropped, which the browser observes as an abnormal close.

use axum::extract::ws::{Message as AxumWsMsg, WebSocket, WebSocketUpgrade};
use axum::http::header::{HeaderMap, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungsteniteMsg;

use crate::proxy::target_url;
use crate::router::AppState;

/// Upstream WebSocket URL: the preview base with `ws`/`wss` scheme.
pub fn websocket_url(base: &str, path_and_query: &str) -> Option<Url> {
    let mut url = target_url(base, path_and_query)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme).ok()?;
    Some(url)
}

/// Subprotocols the client offered, in order.
pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

pub fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    host: String,
    path_and_query: String,
    protocols: Vec<String>,
) -> Response {
    let ws = if protocols.is_empty() {
        ws
    } else {
        ws.protocols(protocols.clone())
    };
    ws.on_upgrade(move |socket| tunnel(socket, state, host, path_and_query, protocols))
}

async fn tunnel(
    client_ws: WebSocket,
    state: AppState,
    host: String,
    path_and_query: String,
    protocols: Vec<String>,
) {
    let resolved = match state.resolver.resolve(&host).await {
        Ok(resolved) => resolved,
        Err(error) => {
            tracing::warn!(host = %host, error = %error, "websocket preview resolution failed");
            return;
        }
    };
    let Some(url) = websocket_url(&resolved.url, &path_and_query) else {
        tracing::warn!(sandbox = %resolved.address, "preview upstream url is invalid");
        return;
    };

    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(sandbox = %resolved.address, error = %error, "invalid websocket upstream request");
            return;
        }
    };
    let headers = request.headers_mut();
    if let Ok(token) = HeaderValue::from_str(&resolved.token) {
        headers.insert(state.forwarder.token_header().clone(), token);
    }
    if !protocols.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&protocols.join(", ")) {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    let backend_ws = match tokio_tungstenite::connect_async(request).await {
        Ok((backend_ws, _)) => backend_ws,
        Err(error) => {
            tracing::warn!(sandbox = %resolved.address, error = %error, "websocket upstream connection failed");
            return;
        }
    };
    tracing::debug!(sandbox = %resolved.address, path = %url.path(), "websocket tunnel open");

    relay(client_ws, backend_ws).await;

    tracing::debug!(sandbox = %resolved.address, "websocket tunnel closed");
}

async fn relay<S>(client_ws: WebSocket, backend_ws: tokio_tungstenite::WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client_ws.split();
    let (mut backend_tx, mut backend_rx) = backend_ws.split();

    let client_to_backend = async move {
        while let Some(Ok(msg)) = client_rx.next().await {
            let msg = match msg {
                AxumWsMsg::Text(t) => TungsteniteMsg::Text(t.as_str().to_owned()),
                AxumWsMsg::Binary(b) => TungsteniteMsg::Binary(b.to_vec()),
                AxumWsMsg::Ping(p) => TungsteniteMsg::Ping(p.to_vec()),
                AxumWsMsg::Pong(p) => TungsteniteMsg::Pong(p.to_vec()),
                AxumWsMsg::Close(_) => break,
            };
            if backend_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = backend_tx.close().await;
    };

    let backend_to_client = async move {
        while let Some(Ok(msg)) = backend_rx.next().await {
            let msg = match msg {
                TungsteniteMsg::Text(t) => AxumWsMsg::Text(t.into()),
                TungsteniteMsg::Binary(b) => AxumWsMsg::Binary(b.into()),
                TungsteniteMsg::Ping(p) => AxumWsMsg::Ping(p.into()),
                TungsteniteMsg::Pong(p) => AxumWsMsg::Pong(p.into()),
                TungsteniteMsg::Close(_) => break,
                TungsteniteMsg::Frame(_) => continue,
            };
            if client_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_backend => {},
        _ = backend_to_client => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_scheme_for_upstream() {
        let url = websocket_url("https://3000-abc.proxy.test", "/@vite/client?t=1").unwrap();
        assert_eq!(url.as_str(), "wss://3000-abc.proxy.test/@vite/client?t=1");

        let url = websocket_url("http://127.0.0.1:5173/", "/hmr").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:5173/hmr");
    }

    #[test]
    fn collects_offered_subprotocols() {
        let mut headers = HeaderMap::new();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("vite-hmr, vite-ping"));
        assert_eq!(requested_protocols(&headers), vec!["vite-hmr", "vite-ping"]);
        assert!(requested_protocols(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn detects_upgrade_requests() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));
        headers.insert(axum::http::header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade_request(&headers));
    }
}
