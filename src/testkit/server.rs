//! A minimal HTTP/1.1 server that answers from a script.
//!
//! Every connection serves one request and is then closed. Responses are
//! taken from the script in arrival order; once the script runs out the
//! last entry repeats.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    delay: Duration,
}

impl ScriptedResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Wait this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn render(&self) -> String {
        let reason = StatusCode::from_u16(self.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("Unknown");
        let mut head = format!(
            "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nconnection: close\r\n",
            self.status,
            reason,
            self.body.len()
        );
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        head.push_str(&self.body);
        head
    }
}

/// Scripted HTTP server bound to an ephemeral localhost port.
pub struct ScriptedServer {
    addr: SocketAddr,
    served: Arc<AtomicUsize>,
    request_lines: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start(script: Vec<ScriptedResponse>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let served = Arc::new(AtomicUsize::new(0));
        let request_lines = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(if script.is_empty() {
            vec![ScriptedResponse::ok("")]
        } else {
            script
        });

        let handle = {
            let served = served.clone();
            let request_lines = request_lines.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let served = served.clone();
                    let request_lines = request_lines.clone();
                    let script = script.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, &script, &served, &request_lines).await;
                    });
                }
            })
        };

        Ok(Self {
            addr,
            served,
            request_lines,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Requests answered so far.
    pub fn requests(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Request lines (`"GET /path HTTP/1.1"`) in arrival order.
    pub fn request_lines(&self) -> Vec<String> {
        self.request_lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    script: &[ScriptedResponse],
    served: &AtomicUsize,
    request_lines: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    if let Ok(mut lines) = request_lines.lock() {
        lines.push(head.lines().next().unwrap_or_default().to_string());
    }
    let index = served.fetch_add(1, Ordering::SeqCst);
    let response = &script[index.min(script.len() - 1)];
    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }
    stream.write_all(response.render().as_bytes()).await?;
    stream.shutdown().await
}

/// A URL on a localhost port with nothing listening.
pub async fn refused_url() -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{addr}/"))
}
