//! Shared helpers: a raw TCP mock backend and raw HTTP/1.1 clients
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Minimal HTTP backend.
///
/// - `/status/{code}` answers with that status
/// - `/slow/{ms}` sleeps before answering 200
/// - `/stall/{ms}` sends the head and half the body, then sleeps before the rest
/// - `/echo...` answers 200 with the received request head as body
/// - `/ws` switches protocols and echoes bytes back
/// - anything else answers 200 `ok`
///
/// Every response is additionally delayed by the configured base delay.
pub struct MockBackend {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        Self::with_delay(Duration::ZERO).await
    }

    pub async fn with_delay(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let _ = serve(stream, delay, counter).await;
                });
            }
        });

        Self { addr, hits, handle }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn reset_hits(&self) {
        self.hits.store(0, Ordering::SeqCst);
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, delay: Duration, hits: Arc<AtomicUsize>) -> std::io::Result<()> {
    let head = read_head(&mut stream).await?;
    hits.fetch_add(1, Ordering::SeqCst);

    let path = head
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .unwrap_or("/")
        .to_string();

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if path == "/ws" {
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await?;
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..n]).await?;
        }
    }

    if let Some(ms) = path.strip_prefix("/stall/") {
        stream
            .write_all(b"HTTP/1.1 200 Mock\r\nContent-Type: text/plain\r\nContent-Length: 10\r\n\r\nfirst")
            .await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_millis(ms.parse().unwrap_or(0))).await;
        stream.write_all(b"-half").await?;
        return stream.shutdown().await;
    }

    let (status, body) = if let Some(code) = path.strip_prefix("/status/") {
        (code.parse::<u16>().unwrap_or(500), String::new())
    } else if let Some(ms) = path.strip_prefix("/slow/") {
        tokio::time::sleep(Duration::from_millis(ms.parse().unwrap_or(0))).await;
        (200, "slow".to_string())
    } else if path.starts_with("/echo") {
        (200, head.clone())
    } else {
        (200, "ok".to_string())
    };

    let response = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn read_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// An address nothing listens on
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Send a raw request and read the whole response
pub async fn send_raw(addr: SocketAddr, request: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

pub async fn http_get(addr: SocketAddr, path: &str) -> std::io::Result<String> {
    http_get_with_host(addr, path, &addr.to_string()).await
}

pub async fn http_get_with_host(addr: SocketAddr, path: &str, host: &str) -> std::io::Result<String> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    send_raw(addr, &request).await
}

pub async fn http_post(addr: SocketAddr, path: &str) -> std::io::Result<String> {
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        path, addr
    );
    send_raw(addr, &request).await
}

pub fn status_of(response: &str) -> u16 {
    response
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

/// Header value from a raw response, matched case-insensitively
pub fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split_once("\r\n\r\n").map(|(h, _)| h).unwrap_or(response);
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
