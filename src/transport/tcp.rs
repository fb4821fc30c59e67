//! TCP-backed peer links, named-port connect/accept, and process spawn.
//!
//! One bounded channel per peer link, drained by a dedicated task that owns
//! the socket, with exponential-backoff retries on connect.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::descriptor::{Host, SshTarget};
use crate::error::{Result, WatershedError};
use crate::message::{Message, HEADER_LEN_BYTES};
use crate::transport::{GroupHandle, Inbox};

const CONNECT_ATTEMPTS: usize = 32;
const RETRY_INITIAL_TIMEOUT: Duration = Duration::from_millis(8);
const RETRY_MAX_TIMEOUT: Duration = Duration::from_secs(1);
const LINK_CHANNEL_CAPACITY: usize = 64;

/// The sending half of a peer reached over the network: messages enqueued
/// here are drained by a background task and written to the socket.
#[derive(Clone)]
pub struct RemoteLink {
    tx: mpsc::Sender<Message>,
}

impl RemoteLink {
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .try_send(message)
            .map_err(|e| WatershedError::Transport(format!("remote link closed or full: {e}")))
    }
}

/// Opens a TCP listener and returns its advertised port string
/// (`host:port`), mirroring the "open a persistent named port" primitive of
/// §4.1. `accept_one` completes the handshake for a single inbound peer.
pub struct Port {
    listener: TcpListener,
    advertised: String,
}

impl Port {
    pub async fn open(bind_addr: &str) -> Result<Port> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;
        Ok(Port {
            listener,
            advertised: local.to_string(),
        })
    }

    pub fn advertised(&self) -> &str {
        &self.advertised
    }

    /// Accepts one inbound connection and wires it into `group` under
    /// `remote_rank`, spawning the read/write pump tasks.
    pub async fn accept_one(&self, group: &GroupHandle, remote_rank: i32) -> Result<()> {
        let (stream, _peer) = self.listener.accept().await?;
        attach(group, remote_rank, stream);
        Ok(())
    }
}

/// Dials `address` with exponential backoff and wires the resulting
/// connection into `group` under `remote_rank`.
pub async fn connect(group: &GroupHandle, remote_rank: i32, address: &str) -> Result<()> {
    let socket_addr: SocketAddr = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| WatershedError::Transport(format!("cannot resolve {address}")))?;

    let mut retry_delay = RETRY_INITIAL_TIMEOUT;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => {
                attach(group, remote_rank, stream);
                return Ok(());
            }
            Err(err) => {
                let level_warn = matches!(err.kind(), ErrorKind::ConnectionRefused) && attempt > 4;
                if level_warn {
                    tracing::warn!(%address, attempt, "connect attempt failed: {err}");
                } else {
                    tracing::debug!(%address, attempt, "connect attempt failed: {err}");
                }
            }
        }
        tokio::time::sleep(retry_delay).await;
        retry_delay = (retry_delay * 2).min(RETRY_MAX_TIMEOUT);
    }
    Err(WatershedError::Transport(format!(
        "failed to connect to {address} after {CONNECT_ATTEMPTS} attempts"
    )))
}

fn attach(group: &GroupHandle, remote_rank: i32, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    group.join_remote(remote_rank, RemoteLink { tx });

    let inbox = group.own_inbox();
    tokio::spawn(reader_pump(read_half, remote_rank, inbox));
    tokio::spawn(writer_pump(write_half, rx));
}

async fn reader_pump(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    remote_rank: i32,
    inbox: std::sync::Arc<Inbox>,
) {
    loop {
        let mut header = [0u8; HEADER_LEN_BYTES];
        if read_half.read_exact(&mut header).await.is_err() {
            tracing::debug!(remote_rank, "peer connection closed");
            return;
        }
        let (data_size, fields) = match Message::decode_header(&header) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(remote_rank, "malformed frame header: {e}");
                return;
            }
        };
        let mut payload = vec![0u8; data_size];
        if read_half.read_exact(&mut payload).await.is_err() {
            return;
        }
        let message = Message::from_parts(fields, payload);
        inbox.push(crate::transport::Envelope {
            from: remote_rank,
            message,
        });
    }
}

async fn writer_pump(mut write_half: tokio::net::tcp::OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let encoded = match message.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("failed to encode outbound message: {e}");
                continue;
            }
        };
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Spawns one instance of a module binary on `host`: locally via
/// `tokio::process::Command` when `host.ssh` is unset, or remotely via SSH
/// (feature `ssh`) otherwise. Returns once the child process has been
/// launched; it is the caller's responsibility to complete the handshake
/// over the port the child advertises.
pub async fn spawn_instance(host: &Host, binary: &str, args: &[String]) -> Result<()> {
    match &host.ssh {
        None => spawn_local(binary, args).await,
        #[cfg(feature = "ssh")]
        Some(target) => spawn_remote(target, binary, args).await,
        #[cfg(not(feature = "ssh"))]
        Some(_) => Err(WatershedError::ProcessSpawn(
            "host declares an SSH target but the `ssh` feature is disabled".into(),
        )),
    }
}

async fn spawn_local(binary: &str, args: &[String]) -> Result<()> {
    tokio::process::Command::new(binary)
        .args(args)
        .spawn()
        .map_err(|e| WatershedError::ProcessSpawn(format!("failed to spawn {binary}: {e}")))?;
    Ok(())
}

#[cfg(feature = "ssh")]
async fn spawn_remote(target: &SshTarget, binary: &str, args: &[String]) -> Result<()> {
    use std::io::Read;
    use std::net::TcpStream as StdTcpStream;

    let target = target.clone();
    let binary = binary.to_string();
    let args = args.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let addr = format!("{}:{}", target.address, target.port.unwrap_or(22));
        let tcp = StdTcpStream::connect(&addr)
            .map_err(|e| WatershedError::ProcessSpawn(format!("ssh tcp connect {addr}: {e}")))?;
        let mut session = ssh2::Session::new()
            .map_err(|e| WatershedError::ProcessSpawn(format!("ssh session init: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| WatershedError::ProcessSpawn(format!("ssh handshake: {e}")))?;
        if let Some(key_file) = &target.key_file {
            session
                .userauth_pubkey_file(&target.username, None, std::path::Path::new(key_file), None)
                .map_err(|e| WatershedError::ProcessSpawn(format!("ssh auth: {e}")))?;
        }
        let command = std::iter::once(binary.clone())
            .chain(args.iter().map(|a| shell_escape::escape(a.into()).into_owned()))
            .collect::<Vec<_>>()
            .join(" ");
        let mut channel = session
            .channel_session()
            .map_err(|e| WatershedError::ProcessSpawn(format!("ssh channel: {e}")))?;
        channel
            .exec(&command)
            .map_err(|e| WatershedError::ProcessSpawn(format!("ssh exec {command}: {e}")))?;
        let mut discard = String::new();
        let _ = channel.read_to_string(&mut discard);
        Ok(())
    })
    .await
    .map_err(|e| WatershedError::ProcessSpawn(format!("ssh spawn task panicked: {e}")))?
}
