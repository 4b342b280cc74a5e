//! DNS server (spec §4.4): UDP+TCP on port 53, an ordered record table,
//! `.local`/`.mshome.net` skip rule, and NXDOMAIN fallback with an optional
//! upstream forward.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::RwLock;
use regex::Regex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event_bus::{Event, EventBus};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Emitted whenever no record answers a question; `answers` is always
/// empty for the unmatched case (§4.4).
#[derive(Debug, Clone)]
pub struct DnsQueryEvent {
    pub qname: String,
    pub qtype: RecordType,
    pub answers: Vec<Ipv4Addr>,
}

impl Event for DnsQueryEvent {}

enum Answer {
    Static(Vec<Ipv4Addr>),
    Handler(Arc<dyn Fn(&str, RecordType) -> Vec<Ipv4Addr> + Send + Sync>),
}

/// One entry of the ordered record table (§3 `DnsRecord`): a static list of
/// A records, or a handler invoked per-query.
pub struct DnsRecord {
    host_pattern: Regex,
    type_pattern: Regex,
    answer: Answer,
}

impl DnsRecord {
    pub fn static_a(host_pattern: &str, addresses: Vec<Ipv4Addr>) -> anyhow::Result<Self> {
        Ok(Self {
            host_pattern: Regex::new(host_pattern)?,
            type_pattern: Regex::new("^A$")?,
            answer: Answer::Static(addresses),
        })
    }

    pub fn handler(
        host_pattern: &str,
        type_pattern: &str,
        f: impl Fn(&str, RecordType) -> Vec<Ipv4Addr> + Send + Sync + 'static,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            host_pattern: Regex::new(host_pattern)?,
            type_pattern: Regex::new(type_pattern)?,
            answer: Answer::Handler(Arc::new(f)),
        })
    }

    fn resolve(&self, qname: &str, qtype: RecordType) -> Option<Vec<Ipv4Addr>> {
        if !self.host_pattern.is_match(qname) || !self.type_pattern.is_match(&qtype.to_string()) {
            return None;
        }
        match &self.answer {
            Answer::Static(addrs) => Some(addrs.clone()),
            Answer::Handler(f) => {
                let result = f(qname, qtype);
                if result.is_empty() {
                    None
                } else {
                    Some(result)
                }
            }
        }
    }
}

pub struct DnsServer {
    address: Ipv4Addr,
    records: RwLock<Vec<DnsRecord>>,
    upstream: Option<Ipv4Addr>,
    events: EventBus,
}

impl DnsServer {
    pub fn new(address: Ipv4Addr, upstream: Option<Ipv4Addr>, events: EventBus) -> Self {
        Self {
            address,
            records: RwLock::new(Vec::new()),
            upstream,
            events,
        }
    }

    pub fn add_record(&self, record: DnsRecord) {
        self.records.write().push(record);
    }

    pub fn clear_records(&self) {
        self.records.write().clear();
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let udp = UdpSocket::bind((self.address, 53)).await?;
        let tcp = TcpListener::bind((self.address, 53)).await?;
        info!(addr = %self.address, "DNS listener bound");

        let udp_cancel = cancel.clone();
        let udp_server = Arc::clone(&self);
        let udp_task = tokio::spawn(async move { udp_server.run_udp(udp, udp_cancel).await });

        let tcp_cancel = cancel;
        let tcp_server = Arc::clone(&self);
        let tcp_task = tokio::spawn(async move { tcp_server.run_tcp(tcp, tcp_cancel).await });

        let (udp_result, tcp_result) = tokio::join!(udp_task, tcp_task);
        udp_result??;
        tcp_result??;
        Ok(())
    }

    async fn run_udp(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("DNS UDP listener shutting down");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(err) => { warn!(error = %err, "DNS UDP recv failed"); continue; }
                    };
                    match self.build_reply(&buf[..len]).await {
                        Ok(reply) => {
                            if let Err(err) = socket.send_to(&reply, peer).await {
                                warn!(error = %err, "DNS UDP reply send failed");
                            }
                        }
                        Err(err) => warn!(error = %err, "dropping malformed DNS query"),
                    }
                }
            }
        }
    }

    async fn run_tcp(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("DNS TCP listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let Ok((mut stream, _peer)) = accepted else { continue };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        use tokio::io::{AsyncReadExt, AsyncWriteExt};
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() {
                            return;
                        }
                        let len = u16::from_be_bytes(len_buf) as usize;
                        let mut buf = vec![0u8; len];
                        if stream.read_exact(&mut buf).await.is_err() {
                            return;
                        }
                        if let Ok(reply) = server.build_reply(&buf).await {
                            let len_prefix = (reply.len() as u16).to_be_bytes();
                            let _ = stream.write_all(&len_prefix).await;
                            let _ = stream.write_all(&reply).await;
                        }
                    });
                }
            }
        }
    }

    async fn build_reply(&self, query_bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
        let query = Message::from_bytes(query_bytes)?;
        let mut reply = Message::new();
        reply.set_id(query.id());
        reply.set_message_type(MessageType::Response);
        reply.set_op_code(query.op_code());
        reply.set_recursion_desired(query.recursion_desired());
        reply.set_recursion_available(true);

        let mut any_answered = false;
        for question in query.queries() {
            reply.add_query(question.clone());
            let qname = question.name().to_utf8();
            let qname = qname.trim_end_matches('.');
            let qtype = question.query_type();

            if qname.ends_with(".local") || qname.ends_with(".mshome.net") {
                continue;
            }

            let answers = self
                .records
                .read()
                .iter()
                .find_map(|record| record.resolve(qname, qtype));

            let answers = match answers {
                Some(answers) => answers,
                None => match self.try_upstream(qname, qtype).await {
                    Some(answers) => answers,
                    None => {
                        self.events.publish(DnsQueryEvent {
                            qname: qname.to_string(),
                            qtype,
                            answers: Vec::new(),
                        });
                        continue;
                    }
                },
            };

            any_answered = true;
            self.events.publish(DnsQueryEvent {
                qname: qname.to_string(),
                qtype,
                answers: answers.clone(),
            });

            for addr in answers {
                let name = Name::from_utf8(format!("{qname}.")).unwrap_or_else(|_| question.name().clone());
                let record = Record::from_rdata(name, 60, RData::A(A(addr)));
                reply.add_answer(record);
            }
        }

        reply.set_response_code(if any_answered {
            ResponseCode::NoError
        } else {
            ResponseCode::NXDomain
        });

        Ok(reply.to_bytes()?)
    }

    /// Supplemented feature: forward unmatched questions upstream with a
    /// 2-second timeout (§4.4, §5).
    async fn try_upstream(&self, qname: &str, qtype: RecordType) -> Option<Vec<Ipv4Addr>> {
        let upstream = self.upstream?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;

        let mut query = Message::new();
        query.set_id(rand::random());
        query.set_message_type(MessageType::Query);
        query.set_recursion_desired(true);
        let name = Name::from_utf8(format!("{qname}.")).ok()?;
        let mut question = hickory_proto::op::Query::new();
        question.set_name(name).set_query_type(qtype);
        query.add_query(question);

        let bytes = query.to_bytes().ok()?;
        socket
            .send_to(&bytes, SocketAddr::new(IpAddr::V4(upstream), 53))
            .await
            .ok()?;

        let mut buf = [0u8; 4096];
        let (len, _) = timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        let reply = Message::from_bytes(&buf[..len]).ok()?;

        let addrs: Vec<Ipv4Addr> = reply
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(A(addr))) => Some(*addr),
                _ => None,
            })
            .collect();

        if addrs.is_empty() {
            debug!(qname, "upstream returned no A records");
            None
        } else {
            Some(addrs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_and_mshome_names_are_always_skipped() {
        assert!("device.local".ends_with(".local"));
        assert!("device.mshome.net".ends_with(".mshome.net"));
    }

    #[test]
    fn first_matching_record_wins() {
        let a = DnsRecord::static_a("^a\\.example\\.com$", vec!["1.1.1.1".parse().unwrap()]).unwrap();
        let b = DnsRecord::static_a("^a\\.example\\.com$", vec!["2.2.2.2".parse().unwrap()]).unwrap();
        let records = vec![a, b];
        let resolved = records
            .iter()
            .find_map(|r| r.resolve("a.example.com", RecordType::A));
        assert_eq!(resolved, Some(vec!["1.1.1.1".parse().unwrap()]));
    }
}
