//! rtmpd integration test harness.
//!
//! Each test starts its own server on an ephemeral loopback port and
//! talks to it with a minimal client built from the same crates: the
//! client-role handshake, `prepare_message` for framing and a `Demuxer`
//! for replies.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use rtmp_core::amf::{self, Cursor, Elt, Value};
use rtmp_core::message::{ControlMessage, UserEvent};
use rtmp_core::wire::{CSID_AMF_INI, DEFAULT_CHUNK_SIZE};
use rtmp_core::{BufferPool, Header, MessageType, RtmpConfig};
use rtmpd::chunk::{prepare_message, Demuxer, Message};
use rtmpd::session::handshake::{self, Handshake};
use rtmpd::session::HandshakeBuffer;
use rtmpd::{handlers, Dispatcher, Server};

mod infra;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a test waits for any single reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A server running on its own task. Shuts down on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Config for tests: loopback, ephemeral port, one worker.
pub fn test_config() -> RtmpConfig {
    let mut config = RtmpConfig::default();
    config.server.listen = "127.0.0.1:0".parse().unwrap();
    config.server.workers = 1;
    config
}

pub fn start_server(config: RtmpConfig) -> Result<TestServer> {
    let mut d = Dispatcher::new();
    handlers::register_defaults(&mut d);
    let server = Server::bind(Arc::new(config), Arc::new(d)).context("bind test server")?;
    let addr = server.local_addr()?;

    let (shutdown, rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if let Err(e) = server.run(rx).await {
            eprintln!("test server exited: {e:#}");
        }
    });
    Ok(TestServer { addr, shutdown })
}

/// Client end of one connection.
pub struct Client {
    stream: TcpStream,
    pub handshake: Handshake,
    out: BufferPool,
    demux: Demuxer,
    inbuf: BytesMut,
}

impl Client {
    /// Connect and complete the handshake.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut hs = Handshake::client(HandshakeBuffer::unpooled(), 0);
        handshake::drive(&stream, &mut hs, REPLY_TIMEOUT).await?;
        Ok(Self {
            stream,
            handshake: hs,
            out: BufferPool::new(DEFAULT_CHUNK_SIZE),
            demux: Demuxer::new(64, 16 << 20, true),
            inbuf: BytesMut::new(),
        })
    }

    /// Frame and send one message with a format 0 header.
    pub async fn send(&mut self, h: Header, payload: &[u8]) -> Result<()> {
        let mut chain = self.out.chain_from(payload)?;
        prepare_message(&h, None, &mut chain, &self.out, true)?;
        self.send_raw(&chain.to_vec()).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn command(&mut self, values: &[Value<'_>]) -> Result<()> {
        let body = amf::encode(&self.out, values)?.to_vec();
        self.send(Header::new(CSID_AMF_INI, MessageType::AmfCommand, 0, 0), &body).await
    }

    /// Announce a new inbound chunk size to the server and switch to it.
    pub async fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        let msg = ControlMessage::SetChunkSize(size);
        self.send(Header::new(2, msg.message_type(), 0, 0), &msg.encode()).await?;
        self.out = BufferPool::new(size as usize);
        Ok(())
    }

    /// Next complete message from the server. Chunk size changes are
    /// applied before the message is returned.
    pub async fn recv(&mut self) -> Result<Message> {
        tokio::time::timeout(REPLY_TIMEOUT, self.recv_inner())
            .await
            .context("timed out waiting for a message")?
    }

    async fn recv_inner(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.demux.poll(&mut self.inbuf)? {
                if msg.header.msg_type == MessageType::SetChunkSize as u8 {
                    if let ControlMessage::SetChunkSize(size) =
                        ControlMessage::parse(MessageType::SetChunkSize, &msg.payload.to_vec())?
                    {
                        self.demux.set_chunk_size(size, msg.header.csid)?;
                    }
                }
                return Ok(msg);
            }
            if self.stream.read_buf(&mut self.inbuf).await? == 0 {
                bail!("server closed the connection");
            }
        }
    }

    /// Skip messages until one of `msg_type` arrives.
    pub async fn recv_type(&mut self, msg_type: MessageType) -> Result<Message> {
        loop {
            let msg = self.recv().await?;
            if msg.header.msg_type == msg_type as u8 {
                return Ok(msg);
            }
        }
    }

    /// Wait for the server to close, discarding anything it still sends.
    pub async fn expect_closed(&mut self) -> Result<()> {
        let mut scratch = [0u8; 4096];
        let wait = async {
            loop {
                match self.stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        };
        tokio::time::timeout(REPLY_TIMEOUT, wait)
            .await
            .context("server kept the connection open")
    }
}

/// Command name and transaction id of an AMF command reply.
pub fn reply_head(msg: &Message) -> Result<(String, f64)> {
    let mut name = String::new();
    let mut trans = 0.0;
    amf::decode(
        &mut Cursor::from_chain(&msg.payload),
        &mut [Elt::string("", &mut name), Elt::number("", &mut trans)],
    )?;
    Ok((name, trans))
}

pub fn connect_values(app: &str) -> Vec<Value<'_>> {
    vec![
        Value::string("connect"),
        Value::Number(1.0),
        Value::object([
            ("app", Value::string(app)),
            ("flashVer", Value::string("LNX 9,0,124,2")),
            ("tcUrl", Value::string("rtmp://127.0.0.1/live")),
            ("fpad", Value::Boolean(false)),
            ("capabilities", Value::Number(15.0)),
            ("audioCodecs", Value::Number(3575.0)),
            ("videoCodecs", Value::Number(252.0)),
            ("videoFunction", Value::Number(1.0)),
        ]),
    ]
}

pub fn is_ping_request(msg: &Message) -> bool {
    msg.header.msg_type == MessageType::UserControl as u8
        && matches!(UserEvent::parse(&msg.payload.to_vec()), Ok(UserEvent::PingRequest(_)))
}
