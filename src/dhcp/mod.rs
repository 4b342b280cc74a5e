//! DHCP server (spec §4.3): a UDP listener on port 67 bound to the
//! virtual-cloud address, handing out stable leases on a configured /24
//! range.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use dhcproto::v4::{DhcpOption, DhcpOptions, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event_bus::{Event, EventBus};
use crate::net::Ip4Config;

const SERVER_PORT: u16 = 67;
const CLIENT_PORT: u16 = 68;
const LEASE_TIME_SECS: u32 = 7 * 24 * 60 * 60;
const RENEW_TIME_SECS: u32 = 12 * 60 * 60;
const REBIND_TIME_SECS: u32 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("DHCP address pool exhausted")]
    NoAddressesAvailable,
    #[error("malformed DHCP packet: {0}")]
    ProtocolParse(String),
}

/// A granted lease (§3 `DhcpLease`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub client_mac: [u8; 6],
    pub address: Ipv4Addr,
    pub host_name: Option<String>,
    pub vendor_class_id: Option<String>,
}

/// Broadcast on REQUEST/INFORM only, never on a DISCOVER offer (§4.3).
#[derive(Debug, Clone)]
pub struct DhcpLeaseEvent {
    pub lease: DhcpLease,
}

impl Event for DhcpLeaseEvent {}

#[derive(Default)]
struct LeaseTable {
    by_mac: HashMap<[u8; 6], Ipv4Addr>,
}

impl LeaseTable {
    /// Reuses any prior mapping for `mac`; otherwise scans `range` for the
    /// first unassigned address.
    fn choose(&mut self, mac: [u8; 6], range: (Ipv4Addr, Ipv4Addr)) -> Result<Ipv4Addr, DhcpError> {
        if let Some(addr) = self.by_mac.get(&mac) {
            return Ok(*addr);
        }
        let (start, end) = (u32::from(range.0), u32::from(range.1));
        let taken: HashSet<u32> = self.by_mac.values().map(|a| u32::from(*a)).collect();
        let mut candidate = start;
        while taken.contains(&candidate) {
            if candidate >= end {
                return Err(DhcpError::NoAddressesAvailable);
            }
            candidate += 1;
        }
        let address = Ipv4Addr::from(candidate);
        self.by_mac.insert(mac, address);
        Ok(address)
    }
}

pub struct DhcpServer {
    ip4config: Ip4Config,
    range: (Ipv4Addr, Ipv4Addr),
    dns: Option<Ipv4Addr>,
    leases: Mutex<LeaseTable>,
    events: EventBus,
}

impl DhcpServer {
    pub fn new(
        ip4config: Ip4Config,
        range: (Ipv4Addr, Ipv4Addr),
        dns: Option<Ipv4Addr>,
        events: EventBus,
    ) -> Self {
        Self {
            ip4config,
            range,
            dns,
            leases: Mutex::new(LeaseTable::default()),
            events,
        }
    }

    /// Runs the accept loop until `cancel` fires. Malformed packets are
    /// logged and dropped; the listener itself keeps running (§7).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let socket = UdpSocket::bind((self.ip4config.address(), SERVER_PORT)).await?;
        socket.set_broadcast(true)?;
        info!(addr = %self.ip4config.address(), "DHCP listener bound");

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("DHCP listener shutting down");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, _peer) = match received {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "DHCP recv failed");
                            continue;
                        }
                    };
                    if let Err(err) = self.handle_packet(&socket, &buf[..len]).await {
                        warn!(error = %err, "dropping malformed DHCP packet");
                    }
                }
            }
        }
    }

    async fn handle_packet(&self, socket: &UdpSocket, bytes: &[u8]) -> anyhow::Result<()> {
        let request = Message::decode(&mut Decoder::new(bytes))
            .map_err(|e| DhcpError::ProtocolParse(e.to_string()))?;
        if request.opcode() != Opcode::BootRequest {
            return Ok(());
        }
        let Some(message_type) = request.opts().msg_type() else {
            return Ok(());
        };
        if !matches!(
            message_type,
            MessageType::Discover | MessageType::Request | MessageType::Inform
        ) {
            debug!(?message_type, "ignoring unhandled DHCP message type");
            return Ok(());
        }

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&request.chaddr()[0..6]);

        let host_name = option_string(request.opts().get(OptionCode::Hostname));
        let vendor_class_id = option_string(request.opts().get(OptionCode::ClassIdentifier));

        let address = self.leases.lock().choose(mac, self.range)?;

        let mut reply = Message::default();
        reply.set_opcode(Opcode::BootReply);
        reply.set_htype(request.htype());
        reply.set_xid(request.xid());
        reply.set_flags(request.flags());
        reply.set_chaddr(request.chaddr());
        reply.set_yiaddr(address);
        reply.set_siaddr(self.ip4config.address());

        let reply_type = if message_type == MessageType::Discover {
            MessageType::Offer
        } else {
            MessageType::Ack
        };

        let mut opts = DhcpOptions::new();
        opts.insert(DhcpOption::MessageType(reply_type));
        opts.insert(DhcpOption::ServerIdentifier(self.ip4config.address()));
        opts.insert(DhcpOption::SubnetMask(self.ip4config.netmask()));
        if let Some(gateway) = self.ip4config.gateway() {
            opts.insert(DhcpOption::Router(vec![gateway]));
        }
        if let Some(dns) = self.dns {
            opts.insert(DhcpOption::DomainNameServer(vec![dns]));
            opts.insert(DhcpOption::DomainName("local".to_string()));
        }
        opts.insert(DhcpOption::InterfaceMtu(1500));
        opts.insert(DhcpOption::BroadcastAddr(self.ip4config.broadcast()));
        opts.insert(DhcpOption::AddressLeaseTime(LEASE_TIME_SECS));
        opts.insert(DhcpOption::Renewal(RENEW_TIME_SECS));
        opts.insert(DhcpOption::Rebinding(REBIND_TIME_SECS));

        if let Some(DhcpOption::ParameterRequestList(requested)) =
            request.opts().get(OptionCode::ParameterRequestList)
        {
            let requested = requested.clone();
            let kept: Vec<DhcpOption> = opts
                .iter()
                .filter(|(code, _)| matches!(code, OptionCode::MessageType) || requested.contains(code))
                .map(|(_, opt)| opt.clone())
                .collect();
            opts = DhcpOptions::new();
            for opt in kept {
                opts.insert(opt);
            }
        }
        opts.insert(DhcpOption::End);
        reply.set_opts(opts);

        let mut out = Vec::new();
        reply.encode(&mut Encoder::new(&mut out))?;
        socket
            .send_to(&out, (Ipv4Addr::BROADCAST, CLIENT_PORT))
            .await?;

        info!(mac = ?mac, address = %address, ?message_type, "leased address");

        if message_type != MessageType::Discover {
            self.events.publish(DhcpLeaseEvent {
                lease: DhcpLease {
                    client_mac: mac,
                    address,
                    host_name,
                    vendor_class_id,
                },
            });
        }
        Ok(())
    }
}

fn option_string(option: Option<&DhcpOption>) -> Option<String> {
    match option {
        Some(DhcpOption::Hostname(s) | DhcpOption::ClassIdentifier(s)) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_table_reuses_prior_mapping() {
        let mut table = LeaseTable::default();
        let range = ("10.42.42.10".parse().unwrap(), "10.42.42.12".parse().unwrap());
        let mac_a = [0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01];
        let mac_b = [0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x02];

        let first = table.choose(mac_a, range).unwrap();
        assert_eq!(first, "10.42.42.10".parse::<Ipv4Addr>().unwrap());

        let second = table.choose(mac_b, range).unwrap();
        assert_eq!(second, "10.42.42.11".parse::<Ipv4Addr>().unwrap());

        assert_eq!(table.choose(mac_a, range).unwrap(), first);
    }

    #[test]
    fn lease_table_exhaustion_fails() {
        let mut table = LeaseTable::default();
        let range = ("10.42.42.10".parse().unwrap(), "10.42.42.10".parse().unwrap());
        table
            .choose([0; 6], range)
            .expect("first address should be free");
        let err = table.choose([1; 6], range).unwrap_err();
        assert!(matches!(err, DhcpError::NoAddressesAvailable));
    }
}
