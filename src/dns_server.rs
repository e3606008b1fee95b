//! DNS server subsystem.
//!
//! Messages are read off UDP and, optionally, TCP and parsed with
//! [hickory-proto](https://crates.io/crates/hickory-proto), keeping every
//! question of the message:
//!
//! * **A questions for known names** are answered from the [`RecordStore`]
//!   with a single authoritative record (TTL 60).  If any question of a
//!   message is answered this way, the reply is sent as is and nothing is
//!   forwarded, even when other questions went unanswered.
//! * **Everything else** is relayed to the upstream resolver as the bytes
//!   the client sent, and the resolver's bytes are returned to the client.
//!   If the upstream can't be reached no answer is sent at all, leaving
//!   the retry to the client.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::framing::{read_frame, write_frame};
use crate::store::RecordStore;
use crate::upstream::{Protocol, Upstream};

/// TTL of locally answered records.
pub const LOCAL_TTL: u32 = 60;

/// Largest query accepted over UDP.
const MAX_UDP_QUERY: usize = 4096;

/// Bind the DNS sockets and serve until `shutdown` is cancelled.
///
/// TCP is served on the same address when `tcp_timeout` is set; it is
/// the idle timeout of a TCP connection.
pub async fn run_dns_server(
    bind_addr: SocketAddr,
    tcp_timeout: Option<Duration>,
    handler: ProxDns,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("DNS server starting on {}", bind_addr);

    let udp = UdpSocket::bind(bind_addr).await?;
    let tcp = match tcp_timeout {
        Some(timeout) => Some((TcpListener::bind(bind_addr).await?, timeout)),
        None => None,
    };

    serve(handler, udp, tcp, shutdown).await
}

/// Serve queries on already bound sockets until `shutdown` is cancelled.
pub async fn serve(
    handler: ProxDns,
    udp: UdpSocket,
    tcp: Option<(TcpListener, Duration)>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let handler = Arc::new(handler);
    let tcp_task = tcp.map(|(listener, idle)| {
        tokio::spawn(serve_tcp(listener, idle, handler.clone(), shutdown.clone()))
    });

    serve_udp(Arc::new(udp), handler, shutdown).await;

    if let Some(task) = tcp_task {
        task.await?;
    }
    info!("DNS server stopped");
    Ok(())
}

async fn serve_udp(socket: Arc<UdpSocket>, handler: Arc<ProxDns>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_UDP_QUERY];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(e) => {
                    warn!("Error receiving UDP query: {}", e);
                    continue;
                }
            },
        };

        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Some(reply) = handler.handle(&packet, Protocol::Udp).await {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    error!("Error sending response to {}: {}", peer, e);
                }
            }
        });
    }
}

async fn serve_tcp(
    listener: TcpListener,
    idle: Duration,
    handler: Arc<ProxDns>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting TCP connection: {}", e);
                    continue;
                }
            },
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, idle, &handler).await {
                debug!("TCP connection from {} closed: {}", peer, e);
            }
        });
    }
}

/// Answer queries on one connection, in order, until the client closes it
/// or stays idle for `idle`.
async fn serve_connection(mut stream: TcpStream, idle: Duration, handler: &ProxDns) -> io::Result<()> {
    loop {
        let packet = match timeout(idle, read_frame(&mut stream)).await {
            Err(_) => return Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(res) => res?,
        };
        if let Some(reply) = handler.handle(&packet, Protocol::Tcp).await {
            write_frame(&mut stream, &reply).await?;
        }
    }
}

pub struct ProxDns {
    store: RecordStore,
    upstream: Arc<dyn Upstream>,
}

impl ProxDns {
    pub fn new(store: RecordStore, upstream: Arc<dyn Upstream>) -> Self {
        Self { store, upstream }
    }

    /// The reply to one received message, or `None` when nothing should be
    /// sent back.
    pub async fn handle(&self, packet: &[u8], protocol: Protocol) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping unparsable message: {}", e);
                return None;
            }
        };
        if request.message_type() != MessageType::Query {
            return None;
        }

        if request.op_code() == OpCode::Query {
            let answers = self.local_answers(request.queries()).await;
            if !answers.is_empty() {
                return match local_reply(&request, answers).to_vec() {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        error!("Error encoding response: {}", e);
                        None
                    }
                };
            }
        }

        match self.upstream.exchange(packet, protocol).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(
                    "Error during recursive query for {}: {}",
                    describe(request.queries()),
                    e
                );
                None
            }
        }
    }

    /// A records for every A question whose name is in the store.
    async fn local_answers(&self, queries: &[Query]) -> Vec<Record> {
        let mut answers = Vec::new();
        for query in queries {
            if query.query_type() != RecordType::A {
                continue;
            }
            if let Some(ip) = self.store.get(&query.name().to_string()).await {
                debug!("Local answer {} -> {}", query.name(), ip);
                answers.push(Record::from_rdata(
                    query.name().clone(),
                    LOCAL_TTL,
                    RData::A(A(ip)),
                ));
            }
        }
        answers
    }
}

fn local_reply(request: &Message, answers: Vec<Record>) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_checking_disabled(request.checking_disabled())
        .set_recursion_available(true)
        .set_authoritative(true);
    reply.add_queries(request.queries().iter().cloned());
    reply.add_answers(answers);
    reply
}

fn describe(queries: &[Query]) -> String {
    queries
        .iter()
        .map(|q| format!("{}/{}", q.name(), q.query_type()))
        .collect::<Vec<_>>()
        .join(", ")
}
