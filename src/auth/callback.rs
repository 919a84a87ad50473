//! Local HTTP listener for the OAuth redirect callback.
//!
//! The listener binds `127.0.0.1`, waits for the identity provider to
//! redirect the user's browser back to `/callback`, and surfaces the
//! outcome to the waiting caller through a one-shot future. It handles a
//! single terminal outcome per lifetime: whichever of
//! code-received / provider-error / timeout happens first wins, and every
//! later attempt to resolve is a no-op.
//!
//! After answering a terminal request the listener keeps the socket open
//! for a short grace period so the result page finishes loading in the
//! browser, then shuts itself down.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{LarkError, Result};

/// How long the listener waits for a redirect before giving up.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay between answering the browser and closing the listening socket,
/// so the result page finishes loading before the connection goes away.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const CALLBACK_PATH: &str = "/callback";

const MISSING_PARAMS_BODY: &str = "Missing authorization code or error parameter";

/// Success page shown in the browser. Closes itself after 3 seconds.
const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>授权成功</title>
<style>body{font-family:system-ui;display:flex;align-items:center;justify-content:center;height:100vh;margin:0;background:#f5f6f7;color:#1f2329}
.box{text-align:center;padding:40px;background:#fff;border-radius:8px;box-shadow:0 2px 8px rgba(31,35,41,.08)}
.ok{color:#34c724;font-size:2em;margin-bottom:16px}</style></head>
<body><div class="box"><div class="ok">&#10003;</div><p>授权成功！请返回终端，此窗口将在 3 秒后自动关闭。</p></div>
<script>setTimeout(function(){window.close()},3000)</script></body></html>"#;

/// Error page shown in the browser; the detail text is HTML-escaped.
fn error_html(detail: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>授权失败</title>
<style>body{{font-family:system-ui;display:flex;align-items:center;justify-content:center;height:100vh;margin:0;background:#f5f6f7;color:#1f2329}}
.box{{text-align:center;padding:40px;background:#fff;border-radius:8px;box-shadow:0 2px 8px rgba(31,35,41,.08)}}
.err{{color:#f54a45;font-size:2em;margin-bottom:16px}}</style></head>
<body><div class="box"><div class="err">&#10007;</div><p>授权失败：{}</p><p>请回到终端重新发起授权。</p></div></body></html>"#,
        html_escape(detail)
    )
}

/// Single-slot resolver: exactly one writer ever takes the sender.
type CodeSlot = Arc<Mutex<Option<oneshot::Sender<Result<String>>>>>;

/// The pending authorization code, resolved by the listener at most once.
pub struct PendingCode {
    rx: oneshot::Receiver<Result<String>>,
}

impl PendingCode {
    /// Wait for the redirect outcome: the authorization code on success,
    /// the provider's callback error, or a timeout error.
    ///
    /// # Errors
    ///
    /// Returns [`LarkError::ListenerClosed`] if the listener was stopped
    /// before any terminal outcome arrived.
    pub async fn wait(self) -> Result<String> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(LarkError::ListenerClosed),
        }
    }
}

/// Transient local HTTP endpoint for one authorization attempt.
pub struct CallbackServer {
    timeout: Duration,
    grace: Duration,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl Default for CallbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackServer {
    /// Create a listener with the default 5-minute timeout and 2-second
    /// shutdown grace.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(CALLBACK_TIMEOUT, SHUTDOWN_GRACE)
    }

    /// Create a listener with custom timeout and grace durations.
    #[must_use]
    pub fn with_timeouts(timeout: Duration, grace: Duration) -> Self {
        Self {
            timeout,
            grace,
            shutdown: CancellationToken::new(),
            local_addr: None,
            task: None,
        }
    }

    /// Bind `127.0.0.1:{port}` and start accepting connections.
    ///
    /// Port 0 binds an ephemeral port; the actual address is available via
    /// [`local_addr`](Self::local_addr) afterwards. The returned
    /// [`PendingCode`] resolves with the authorization code, or rejects
    /// with the provider's callback error or a timeout error if nothing
    /// terminal arrives within the timeout window.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound.
    pub async fn start(&mut self, port: u16) -> Result<PendingCode> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);
        tracing::debug!(%addr, "callback listener bound");

        let (tx, rx) = oneshot::channel();
        let slot: CodeSlot = Arc::new(Mutex::new(Some(tx)));
        let shutdown = self.shutdown.clone();
        let timeout = self.timeout;
        let grace = self.grace;
        self.task = Some(tokio::spawn(accept_loop(
            listener, slot, shutdown, timeout, grace,
        )));

        Ok(PendingCode { rx })
    }

    /// The address the listener is bound to, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Shut the listener down. Idempotent: safe to call from the success,
    /// error, and timeout paths alike, and safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::debug!("callback listener task ended abnormally: {e}");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    slot: CodeSlot,
    shutdown: CancellationToken,
    timeout: Duration,
    grace: Duration,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut deadline => {
                if let Some(tx) = take_resolver(&slot) {
                    tracing::warn!(
                        "no authorization callback within {} seconds, giving up",
                        timeout.as_secs()
                    );
                    let _ = tx.send(Err(LarkError::Timeout(timeout.as_secs())));
                }
                // Timed out: close immediately, no grace period.
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "callback connection accepted");
                    handle_connection(stream, &slot, &shutdown, grace).await;
                }
                Err(e) => tracing::warn!("failed to accept callback connection: {e}"),
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    slot: &CodeSlot,
    shutdown: &CancellationToken,
    grace: Duration,
) {
    let mut buf = vec![0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!("failed to read callback request: {e}");
            return;
        }
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    let Some(target) = request_target(&request) else {
        respond(&mut stream, 400, "text/plain", "Bad Request").await;
        return;
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };

    if path != CALLBACK_PATH {
        respond(&mut stream, 404, "text/plain", "Not Found").await;
        return;
    }

    let params = parse_query(query);
    let code = params
        .iter()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.clone())
        .filter(|v| !v.is_empty());
    let error = params
        .iter()
        .find(|(k, _)| k == "error")
        .map(|(_, v)| v.clone());

    if let Some(code) = code {
        respond(&mut stream, 200, "text/html; charset=utf-8", SUCCESS_HTML).await;
        if let Some(tx) = take_resolver(slot) {
            tracing::info!("authorization code received");
            let _ = tx.send(Ok(code));
            schedule_shutdown(shutdown.clone(), grace);
        }
        return;
    }

    if let Some(error) = error {
        let description = params
            .iter()
            .find(|(k, _)| k == "error_description")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let detail = if description.is_empty() {
            error.clone()
        } else {
            format!("{error}: {description}")
        };
        respond(
            &mut stream,
            400,
            "text/html; charset=utf-8",
            &error_html(&detail),
        )
        .await;
        if let Some(tx) = take_resolver(slot) {
            tracing::warn!("provider returned an authorization error: {error}");
            let _ = tx.send(Err(LarkError::callback(error, description)));
            schedule_shutdown(shutdown.clone(), grace);
        }
        return;
    }

    // Neither parameter: answer 400 but keep waiting. A later valid
    // redirect can still resolve the pending code.
    respond(&mut stream, 400, "text/plain", MISSING_PARAMS_BODY).await;
}

fn take_resolver(slot: &CodeSlot) -> Option<oneshot::Sender<Result<String>>> {
    slot.lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take()
}

fn schedule_shutdown(shutdown: CancellationToken, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        shutdown.cancel();
    });
}

async fn respond(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "OK",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        tracing::debug!("failed to write callback response: {e}");
        return;
    }
    let _ = stream.flush().await;
}

/// Extract the request target from the request line, e.g.
/// `GET /callback?code=x HTTP/1.1` -> `/callback?code=x`.
fn request_target(request: &str) -> Option<&str> {
    request.lines().next()?.split_whitespace().nth(1)
}

/// Parse a URL query string into key-value pairs, percent-decoding both.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'%' => {
                let hi = bytes.next().and_then(hex_val);
                let lo = bytes.next().and_then(hex_val);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(((hi << 4) | lo) as char),
                    _ => out.push('%'),
                }
            }
            b'+' => out.push(' '),
            _ => out.push(b as char),
        }
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Escape text for embedding in the HTML result pages.
fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Send a raw GET request and return (status, full response text).
    async fn get(addr: SocketAddr, target: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out).into_owned();
        let status = text
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        (status, text)
    }

    fn quick_server() -> CallbackServer {
        CallbackServer::with_timeouts(Duration::from_secs(30), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn resolves_with_code_and_serves_success_page() {
        let mut server = quick_server();
        let pending = server.start(0).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (status, body) = get(addr, "/callback?code=abc123").await;
        assert_eq!(status, 200);
        assert!(body.contains("text/html; charset=utf-8"));
        assert!(body.contains("授权成功"));
        assert!(body.contains("window.close()"));

        assert_eq!(pending.wait().await.unwrap(), "abc123");
        server.stop().await;
    }

    #[tokio::test]
    async fn rejects_with_provider_error() {
        let mut server = quick_server();
        let pending = server.start(0).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (status, body) =
            get(addr, "/callback?error=access_denied&error_description=nope").await;
        assert_eq!(status, 400);
        assert!(body.contains("text/html; charset=utf-8"));
        assert!(body.contains("access_denied"));

        let err = pending.wait().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("access_denied"));
        assert!(msg.contains("nope"));
        server.stop().await;
    }

    #[tokio::test]
    async fn error_page_escapes_markup() {
        let mut server = quick_server();
        let pending = server.start(0).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (status, body) = get(addr, "/callback?error=%3Cscript%3E").await;
        assert_eq!(status, 400);
        assert!(body.contains("&lt;script&gt;"));
        // The error page carries no script element, so the decoded input
        // must never appear verbatim.
        assert!(!body.contains("<script>"));

        assert!(pending.wait().await.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn missing_params_keeps_waiting() {
        let mut server = quick_server();
        let pending = server.start(0).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (status, body) = get(addr, "/callback").await;
        assert_eq!(status, 400);
        assert!(body.contains(MISSING_PARAMS_BODY));

        // The slot is still armed: a later valid redirect resolves it.
        let (status, _) = get(addr, "/callback?code=late").await;
        assert_eq!(status, 200);
        assert_eq!(pending.wait().await.unwrap(), "late");
        server.stop().await;
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let mut server = quick_server();
        let _pending = server.start(0).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (status, body) = get(addr, "/healthz").await;
        assert_eq!(status, 404);
        assert!(body.contains("Not Found"));
        server.stop().await;
    }

    #[tokio::test]
    async fn only_first_terminal_outcome_wins() {
        let mut server = quick_server();
        let pending = server.start(0).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (status, _) = get(addr, "/callback?code=first").await;
        assert_eq!(status, 200);
        // Second redirect is answered but cannot resolve again.
        let (status, _) = get(addr, "/callback?code=second").await;
        assert_eq!(status, 200);

        assert_eq!(pending.wait().await.unwrap(), "first");
        server.stop().await;
    }

    #[tokio::test]
    async fn times_out_when_no_callback_arrives() {
        let mut server =
            CallbackServer::with_timeouts(Duration::from_millis(50), Duration::from_millis(10));
        let pending = server.start(0).await.unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, LarkError::Timeout(_)));
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut server = quick_server();
        let pending = server.start(0).await.unwrap();
        server.stop().await;
        server.stop().await;

        // Stopping before an outcome surfaces as ListenerClosed.
        assert!(matches!(
            pending.wait().await.unwrap_err(),
            LarkError::ListenerClosed
        ));
    }

    #[test]
    fn escapes_the_five_significant_characters() {
        assert_eq!(
            html_escape(r#"&<>"'"#),
            "&amp;&lt;&gt;&quot;&#x27;"
        );
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
        assert_eq!(html_escape("plain text"), "plain text");
    }

    #[test]
    fn parses_and_decodes_query_pairs() {
        let params = parse_query("code=abc%20def&state=a%3Db&flag");
        assert_eq!(params[0], ("code".into(), "abc def".into()));
        assert_eq!(params[1], ("state".into(), "a=b".into()));
        assert_eq!(params[2], ("flag".into(), String::new()));
    }

    #[test]
    fn decodes_plus_as_space() {
        assert_eq!(percent_decode("hello+world"), "hello world");
        assert_eq!(percent_decode("100%"), "100%");
    }
}
