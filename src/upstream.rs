//! Forwarding of unanswered queries to the upstream resolver.
//!
//! Queries travel as the raw bytes the client sent, and answers come back
//! as the raw bytes the resolver sent. The answer is parsed only to check
//! that it is a DNS message for the query we asked.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use log::debug;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::framing::{read_frame, write_frame};

/// Largest DNS message that fits a UDP datagram.
const MAX_UDP_MESSAGE: usize = 65_535;

/// Transport a query reached us over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// A resolver queries are relayed to when they can't be answered locally.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `query` byte for byte and return the resolver's answer as
    /// received.  `protocol` is the client's transport: a TCP client can
    /// take an answer too large for UDP, a UDP client gets the truncated
    /// one.
    async fn exchange(&self, query: &[u8], protocol: Protocol) -> Result<Vec<u8>>;
}

/// A single resolver reached over UDP, falling back to TCP when the UDP
/// answer is truncated and the client can take a full one.
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    addr: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn udp_round_trip(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let local: SocketAddr = if self.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.addr).await?;
        socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        let len = socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn tcp_round_trip(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(self.addr).await?;
        write_frame(&mut stream, packet).await?;
        Ok(read_frame(&mut stream).await?)
    }

    async fn round_trip(&self, query: &[u8], protocol: Protocol) -> Result<Vec<u8>> {
        let id = message_id(query)?;
        let answer = self.udp_round_trip(query).await?;
        if !check_answer(id, &answer)?.truncated() || protocol == Protocol::Udp {
            return Ok(answer);
        }

        debug!("Truncated answer from {}, retrying over TCP", self.addr);
        let answer = self.tcp_round_trip(query).await?;
        check_answer(id, &answer)?;
        Ok(answer)
    }
}

fn message_id(packet: &[u8]) -> Result<u16> {
    match packet {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "query shorter than a DNS header",
        ))),
    }
}

/// Parse `answer` and make sure it carries the id we sent.
fn check_answer(id: u16, answer: &[u8]) -> Result<Message> {
    let message = Message::from_vec(answer)?;
    if message.id() != id {
        return Err(Error::UpstreamMismatch {
            expected: id,
            got: message.id(),
        });
    }
    Ok(message)
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, query: &[u8], protocol: Protocol) -> Result<Vec<u8>> {
        timeout(self.timeout, self.round_trip(query, protocol))
            .await
            .map_err(|_| Error::UpstreamTimeout(self.addr))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn query(id: u16) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_str("example.com.").unwrap(),
                RecordType::A,
            ));
        msg.to_vec().unwrap()
    }

    fn answer(req: &Message, id: u16, addrs: usize, truncated: bool) -> Vec<u8> {
        let mut resp = Message::new();
        resp.set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_truncated(truncated);
        for q in req.queries() {
            resp.add_query(q.clone());
        }
        for i in 0..addrs {
            resp.add_answer(Record::from_rdata(
                Name::from_str("example.com.").unwrap(),
                300,
                RData::A(A(Ipv4Addr::new(93, 184, 216, i as u8))),
            ));
        }
        resp.to_vec().unwrap()
    }

    /// Answer one query, optionally with a different id.
    async fn fake_resolver(id_offset: u16) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf[..len]).unwrap();
            let resp = answer(&req, req.id().wrapping_add(id_offset), 1, false);
            socket.send_to(&resp, peer).await.unwrap();
        });
        addr
    }

    /// Answer over UDP with TC set and no records, and over TCP with
    /// three records, both on the same port.
    async fn truncating_resolver() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = UdpSocket::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
                let req = Message::from_vec(&buf[..len]).unwrap();
                socket.send_to(&answer(&req, req.id(), 0, true), peer).await.unwrap();
            }
        });
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let packet = read_frame(&mut stream).await.unwrap();
                let req = Message::from_vec(&packet).unwrap();
                write_frame(&mut stream, &answer(&req, req.id(), 3, false))
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_exchange_returns_answer() {
        let addr = fake_resolver(0).await;
        let upstream = UdpUpstream::new(addr, Duration::from_secs(2));
        let bytes = upstream.exchange(&query(0xbeef), Protocol::Udp).await.unwrap();
        let resp = Message::from_vec(&bytes).unwrap();
        assert_eq!(resp.id(), 0xbeef);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].ttl(), 300);
    }

    #[tokio::test]
    async fn test_exchange_rejects_foreign_id() {
        let addr = fake_resolver(1).await;
        let upstream = UdpUpstream::new(addr, Duration::from_secs(2));
        let err = upstream.exchange(&query(7), Protocol::Udp).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamMismatch { expected: 7, got: 8 }));
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpUpstream::new(silent.local_addr().unwrap(), Duration::from_millis(100));
        let err = upstream.exchange(&query(1), Protocol::Udp).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamTimeout(_)));
    }

    #[tokio::test]
    async fn test_truncated_answer_retried_over_tcp() {
        let addr = truncating_resolver().await;
        let upstream = UdpUpstream::new(addr, Duration::from_secs(2));

        let bytes = upstream.exchange(&query(42), Protocol::Tcp).await.unwrap();
        let resp = Message::from_vec(&bytes).unwrap();
        assert_eq!(resp.id(), 42);
        assert!(!resp.truncated());
        assert_eq!(resp.answers().len(), 3);
    }

    #[tokio::test]
    async fn test_truncated_answer_relayed_to_udp_client() {
        let addr = truncating_resolver().await;
        let upstream = UdpUpstream::new(addr, Duration::from_secs(2));

        let bytes = upstream.exchange(&query(43), Protocol::Udp).await.unwrap();
        let resp = Message::from_vec(&bytes).unwrap();
        assert!(resp.truncated());
        assert!(resp.answers().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_answer_is_an_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(b"\x00", peer).await.unwrap();
        });
        let upstream = UdpUpstream::new(addr, Duration::from_secs(2));
        let err = upstream.exchange(&query(5), Protocol::Udp).await.unwrap_err();
        assert!(matches!(err, Error::Proto(_)));
    }
}
