//! Line-framed TCP channel fabric.
//!
//! Realizes the three channel patterns of the dispatch wire protocol over
//! plain TCP, one ASCII message per newline-terminated frame:
//!
//! - request/reply: [`request`] (client) against [`RepServer`];
//! - push/pull fan-in: [`PushClient`] against [`PullServer`];
//! - topic-filtered broadcast: [`PubServer`] against [`SubClient`], where a
//!   subscriber announces `sub <prefix>` once after connecting and receives
//!   only frames starting with that prefix.
//!
//! Servers accept `0` ports (ephemeral bind) and expose the bound address.
//! Every server loop observes a shared shutdown watch each iteration; no
//! unbounded blocking calls.

use anyhow::{bail, Context};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

const PULL_FANIN_DEPTH: usize = 1024;
const SUB_QUEUE_DEPTH: usize = 64;
const SUB_HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// One synchronous request/reply exchange. A fresh connection per exchange
/// keeps a dead peer from wedging any client-side socket state.
pub async fn request(addr: &str, line: &str, timeout: Duration) -> anyhow::Result<String> {
    tokio::time::timeout(timeout, request_inner(addr, line))
        .await
        .map_err(|_| anyhow::anyhow!("request to {addr} timed out"))?
}

async fn request_inner(addr: &str, line: &str) -> anyhow::Result<String> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect req socket {addr}"))?;
    let (read, mut write) = stream.into_split();

    write
        .write_all(line.as_bytes())
        .await
        .with_context(|| format!("send request to {addr}"))?;
    write
        .write_all(b"\n")
        .await
        .with_context(|| format!("send request to {addr}"))?;

    let mut reply = String::new();
    BufReader::new(read)
        .read_line(&mut reply)
        .await
        .with_context(|| format!("read reply from {addr}"))?;
    if reply.is_empty() {
        bail!("peer {addr} closed before replying");
    }
    Ok(reply.trim_end().to_string())
}

/// Reply-side endpoint of a request/reply channel.
pub struct RepServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RepServer {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind rep socket {addr}"))?;
        let local_addr = listener.local_addr().context("rep local_addr")?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown watch flips. The handler gets one request
    /// line and returns the reply line.
    pub async fn serve<H, Fut>(self, handler: H, mut shutdown: watch::Receiver<bool>)
    where
        H: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                res = self.listener.accept() => {
                    match res {
                        Ok((stream, _peer)) => {
                            tokio::spawn(serve_rep_conn(stream, handler.clone(), shutdown.clone()));
                        }
                        Err(err) => {
                            tracing::warn!(
                                event = "fleet.fabric.rep.accept_error",
                                error = %err,
                                "rep accept failed"
                            );
                        }
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }
}

async fn serve_rep_conn<H, Fut>(stream: TcpStream, handler: Arc<H>, mut shutdown: watch::Receiver<bool>)
where
    H: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                let reply = (*handler)(line).await;
                if write_frame(&mut write, &reply).await.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

async fn write_frame(write: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await
}

/// Fire-and-forget sender. Reconnects lazily; a failed send clears the
/// connection and surfaces the error so the owner can run its reconnect
/// protocol.
#[derive(Debug)]
pub struct PushClient {
    addr: String,
    stream: Option<TcpStream>,
}

impl PushClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    /// Eagerly connected variant; fails fast when the peer is not bound.
    pub async fn connect(addr: impl Into<String>) -> anyhow::Result<Self> {
        let addr = addr.into();
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connect push socket {addr}"))?;
        Ok(Self {
            addr,
            stream: Some(stream),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(&self.addr)
                    .await
                    .with_context(|| format!("connect push socket {}", self.addr))?;
                self.stream.insert(stream)
            }
        };

        let res: std::io::Result<()> = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await
        }
        .await;

        if let Err(err) = res {
            self.stream = None;
            return Err(err).with_context(|| format!("push to {}", self.addr));
        }
        Ok(())
    }
}

/// Pull-side endpoint: every frame from every connected pusher funnels into
/// one bounded channel, preserving per-connection order.
pub struct PullServer {
    local_addr: SocketAddr,
    rx: mpsc::Receiver<String>,
}

impl PullServer {
    pub async fn bind(addr: &str, shutdown: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind pull socket {addr}"))?;
        let local_addr = listener.local_addr().context("pull local_addr")?;
        let (tx, rx) = mpsc::channel(PULL_FANIN_DEPTH);
        tokio::spawn(pull_accept_loop(listener, tx, shutdown));
        Ok(Self { local_addr, rx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next frame, or `None` once shut down and drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

async fn pull_accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((stream, _peer)) => {
                        tokio::spawn(pull_conn(stream, tx.clone(), shutdown.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(
                            event = "fleet.fabric.pull.accept_error",
                            error = %err,
                            "pull accept failed"
                        );
                    }
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

async fn pull_conn(stream: TcpStream, tx: mpsc::Sender<String>, mut shutdown: watch::Receiver<bool>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

struct Subscriber {
    prefix: String,
    tx: mpsc::Sender<String>,
}

/// Broadcast endpoint. Frames are delivered best-effort: a subscriber whose
/// queue is full or whose connection broke is dropped, never awaited.
#[derive(Clone)]
pub struct PubServer {
    local_addr: SocketAddr,
    subs: Arc<Mutex<Vec<Subscriber>>>,
}

impl PubServer {
    pub async fn bind(addr: &str, shutdown: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind pub socket {addr}"))?;
        let local_addr = listener.local_addr().context("pub local_addr")?;
        let subs = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(pub_accept_loop(listener, subs.clone(), shutdown));
        Ok(Self { local_addr, subs })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn publish(&self, line: &str) {
        let mut subs = self.subs.lock().await;
        subs.retain(|sub| {
            if !line.starts_with(&sub.prefix) {
                return true;
            }
            sub.tx.try_send(line.to_string()).is_ok()
        });
    }
}

async fn pub_accept_loop(
    listener: TcpListener,
    subs: Arc<Mutex<Vec<Subscriber>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((stream, _peer)) => {
                        tokio::spawn(pub_conn(stream, subs.clone(), shutdown.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(
                            event = "fleet.fabric.pub.accept_error",
                            error = %err,
                            "pub accept failed"
                        );
                    }
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

async fn pub_conn(stream: TcpStream, subs: Arc<Mutex<Vec<Subscriber>>>, mut shutdown: watch::Receiver<bool>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    // First frame must be the subscription announcement.
    let hello = match tokio::time::timeout(SUB_HELLO_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        _ => return,
    };
    let prefix = match hello.as_str() {
        "sub" => String::new(),
        other => match other.strip_prefix("sub ") {
            Some(prefix) => prefix.to_string(),
            None => return,
        },
    };

    let (tx, mut rx) = mpsc::channel(SUB_QUEUE_DEPTH);
    subs.lock().await.push(Subscriber { prefix, tx });

    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { return };
                if write_frame(&mut write, &msg).await.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

/// Subscriber-side endpoint of the broadcast channel.
pub struct SubClient {
    lines: tokio::io::Lines<BufReader<TcpStream>>,
}

impl SubClient {
    pub async fn connect(addr: &str, prefix: &str) -> anyhow::Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect sub socket {addr}"))?;
        stream
            .write_all(format!("sub {prefix}\n").as_bytes())
            .await
            .with_context(|| format!("announce subscription to {addr}"))?;
        Ok(Self {
            lines: BufReader::new(stream).lines(),
        })
    }

    /// Next matching frame, or `None` when the publisher went away.
    pub async fn recv(&mut self) -> anyhow::Result<Option<String>> {
        self.lines.next_line().await.context("sub socket read")
    }
}
