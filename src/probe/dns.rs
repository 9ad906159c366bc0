//! DNS probe implementation using raw UDP packets.
//!
//! The record is looked up on the zone's authoritative nameserver (configured,
//! or discovered through an NS lookup on the recursive resolver). When no
//! authoritative server answers, the query falls back to the recursive
//! resolver itself.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::{CheckError, RawResult};
use crate::db::DnsSettings;

const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;

const RCODE_NXDOMAIN: u8 = 3;

/// Map a record type name to its wire code.
pub fn record_type_code(name: &str) -> Result<u16, CheckError> {
    match name.to_ascii_uppercase().as_str() {
        "A" => Ok(TYPE_A),
        "NS" => Ok(TYPE_NS),
        "CNAME" => Ok(TYPE_CNAME),
        "MX" => Ok(TYPE_MX),
        "TXT" => Ok(TYPE_TXT),
        "AAAA" => Ok(TYPE_AAAA),
        other => Err(CheckError::Config(format!("unsupported record type: {}", other))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Name(String),
    Mx { preference: u16, exchange: String },
    Txt(String),
    Other(Vec<u8>),
}

impl RecordData {
    fn render(&self) -> String {
        match self {
            RecordData::A(ip) => ip.to_string(),
            RecordData::Aaaa(ip) => ip.to_string(),
            RecordData::Name(name) => name.clone(),
            RecordData::Mx { preference, exchange } => format!("{} {}", preference, exchange),
            RecordData::Txt(text) => text.clone(),
            RecordData::Other(bytes) => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ResourceRecord {
    name: String,
    rtype: u16,
    data: RecordData,
}

#[derive(Debug, Clone, Default)]
struct DnsMessage {
    id: u16,
    rcode: u8,
    answers: Vec<ResourceRecord>,
    additional: Vec<ResourceRecord>,
}

impl DnsMessage {
    fn records_of(&self, rtype: u16) -> Vec<String> {
        self.answers
            .iter()
            .filter(|rr| rr.rtype == rtype)
            .map(|rr| rr.data.render())
            .collect()
    }
}

/// Run a DNS check for the monitor's record.
pub async fn run_dns_check(
    settings: &DnsSettings,
    resolver: &str,
    timeout: Duration,
) -> Result<RawResult, CheckError> {
    let qtype = record_type_code(&settings.record_type)?;
    let name = settings.name.trim_end_matches('.');

    let authoritative = match &settings.nameserver {
        Some(ns) => resolve_server(ns).await,
        None => discover_authoritative(name, resolver, timeout).await,
    };

    match authoritative {
        Ok(server) => match query(server, name, qtype, false, timeout).await {
            Ok((msg, elapsed)) if msg.rcode == 0 || msg.rcode == RCODE_NXDOMAIN => {
                return Ok(RawResult::Dns {
                    records: msg.records_of(qtype),
                    response_time: elapsed,
                    server: server.to_string(),
                    authoritative: true,
                });
            }
            Ok((msg, _)) => {
                tracing::warn!(%server, name, rcode = msg.rcode, "authoritative server refused query, using resolver");
            }
            Err(e) => {
                tracing::warn!(%server, name, "authoritative server unreachable, using resolver: {}", e);
            }
        },
        Err(e) => {
            tracing::debug!(name, "no authoritative server found, using resolver: {}", e);
        }
    }

    let server = resolve_server(resolver).await?;
    let (msg, elapsed) = query(server, name, qtype, true, timeout).await?;
    if msg.rcode != 0 && msg.rcode != RCODE_NXDOMAIN {
        return Err(CheckError::Network(format!("DNS error RCODE: {}", msg.rcode)));
    }

    Ok(RawResult::Dns {
        records: msg.records_of(qtype),
        response_time: elapsed,
        server: server.to_string(),
        authoritative: false,
    })
}

/// Find an authoritative nameserver for `name` by walking up its zones.
async fn discover_authoritative(
    name: &str,
    resolver: &str,
    timeout: Duration,
) -> Result<SocketAddr, CheckError> {
    let resolver = resolve_server(resolver).await?;
    let labels: Vec<&str> = name.split('.').collect();

    // Stop above the TLD: its servers only hand out referrals.
    for i in 0..labels.len().saturating_sub(1) {
        let zone = labels[i..].join(".");
        let (msg, _) = query(resolver, &zone, TYPE_NS, true, timeout).await?;

        for ns in msg.records_of(TYPE_NS) {
            // Prefer glue from the additional section
            let glue = msg.additional.iter().find_map(|rr| match &rr.data {
                RecordData::A(ip) if rr.name.eq_ignore_ascii_case(&ns) => Some(IpAddr::V4(*ip)),
                _ => None,
            });
            if let Some(ip) = glue {
                return Ok(SocketAddr::new(ip, 53));
            }

            if let Ok((a, _)) = query(resolver, &ns, TYPE_A, true, timeout).await {
                if let Some(RecordData::A(ip)) = a.answers.iter().map(|rr| &rr.data).find(|d| matches!(d, RecordData::A(_))) {
                    return Ok(SocketAddr::new(IpAddr::V4(*ip), 53));
                }
            }
        }
    }

    Err(CheckError::Network(format!("no authoritative nameserver found for {}", name)))
}

/// Parse `ip`, `ip:port`, `[v6]:port` or a hostname into a server address.
async fn resolve_server(address: &str) -> Result<SocketAddr, CheckError> {
    if let Ok(sa) = address.parse::<SocketAddr>() {
        return Ok(sa);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }

    let target = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:53", address)
    };
    tokio::net::lookup_host(target)
        .await
        .map_err(|e| CheckError::Network(format!("failed to resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| CheckError::Network(format!("no address for {}", address)))
}

/// Send one query and wait for the matching response. Returns the parsed
/// message and the round trip in milliseconds.
async fn query(
    server: SocketAddr,
    name: &str,
    qtype: u16,
    recursion_desired: bool,
    timeout: Duration,
) -> Result<(DnsMessage, f64), CheckError> {
    let tx_id: u16 = rand::random();
    let packet = build_query(tx_id, name, qtype, recursion_desired)?;

    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| CheckError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(server)
        .await
        .map_err(|e| CheckError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();
    socket
        .send(&packet)
        .await
        .map_err(|e| CheckError::Network(format!("failed to send: {}", e)))?;

    let mut buf = [0u8; 4096];
    let receive = async {
        loop {
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|e| CheckError::Network(format!("failed to recv: {}", e)))?;
            let msg = parse_message(&buf[..n])?;
            // Ignore stray responses from earlier queries
            if msg.id == tx_id {
                return Ok::<_, CheckError>(msg);
            }
        }
    };

    let msg = tokio::time::timeout(timeout, receive)
        .await
        .map_err(|_| CheckError::Timeout(timeout))??;
    Ok((msg, start.elapsed().as_secs_f64() * 1000.0))
}

/// Build a standard query packet for one question.
fn build_query(tx_id: u16, name: &str, qtype: u16, recursion_desired: bool) -> Result<Vec<u8>, CheckError> {
    let flags: u16 = if recursion_desired { 0x0100 } else { 0x0000 };

    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN, NS, AR counts

    encode_name(&mut packet, name)?;
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    Ok(packet)
}

fn encode_name(packet: &mut Vec<u8>, name: &str) -> Result<(), CheckError> {
    let name = name.trim_end_matches('.');
    if name.len() > 253 {
        return Err(CheckError::Config(format!("domain name too long: {}", name)));
    }
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(CheckError::Config(format!("label too long: {}", label)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    Ok(())
}

fn malformed(what: &str) -> CheckError {
    CheckError::Network(format!("malformed DNS response: {}", what))
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, CheckError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| malformed("truncated"))
}

/// Read a possibly compressed name starting at `pos`. Returns the name and
/// the offset just past it in the original position.
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), CheckError> {
    let mut labels: Vec<String> = Vec::new();
    let mut end: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *buf.get(pos).ok_or_else(|| malformed("name out of bounds"))? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let pointer = (read_u16(buf, pos)? & 0x3FFF) as usize;
            end.get_or_insert(pos + 2);
            jumps += 1;
            if jumps > 32 {
                return Err(malformed("compression loop"));
            }
            pos = pointer;
            continue;
        }
        let label = buf
            .get(pos + 1..pos + 1 + len)
            .ok_or_else(|| malformed("label out of bounds"))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    Ok((labels.join("."), end.unwrap_or(pos)))
}

fn read_record(buf: &[u8], pos: usize) -> Result<(ResourceRecord, usize), CheckError> {
    let (name, pos) = read_name(buf, pos)?;
    let rtype = read_u16(buf, pos)?;
    let rdlength = read_u16(buf, pos + 8)? as usize;
    let start = pos + 10;
    let rdata = buf
        .get(start..start + rdlength)
        .ok_or_else(|| malformed("rdata out of bounds"))?;

    let data = match rtype {
        TYPE_A if rdlength == 4 => RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
        TYPE_AAAA if rdlength == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        TYPE_NS | TYPE_CNAME => RecordData::Name(read_name(buf, start)?.0),
        TYPE_MX => RecordData::Mx {
            preference: read_u16(buf, start)?,
            exchange: read_name(buf, start + 2)?.0,
        },
        TYPE_TXT => {
            let mut text = String::new();
            let mut i = 0;
            while i < rdata.len() {
                let len = rdata[i] as usize;
                let chunk = rdata.get(i + 1..i + 1 + len).ok_or_else(|| malformed("txt out of bounds"))?;
                text.push_str(&String::from_utf8_lossy(chunk));
                i += 1 + len;
            }
            RecordData::Txt(text)
        }
        _ => RecordData::Other(rdata.to_vec()),
    };

    Ok((ResourceRecord { name, rtype, data }, start + rdlength))
}

fn parse_message(buf: &[u8]) -> Result<DnsMessage, CheckError> {
    if buf.len() < 12 {
        return Err(CheckError::Network(format!("response too short: {} bytes", buf.len())));
    }

    let id = read_u16(buf, 0)?;
    let rcode = buf[3] & 0x0F;
    let qdcount = read_u16(buf, 4)?;
    let ancount = read_u16(buf, 6)?;
    let nscount = read_u16(buf, 8)?;
    let arcount = read_u16(buf, 10)?;

    let mut pos = 12;
    for _ in 0..qdcount {
        let (_, next) = read_name(buf, pos)?;
        pos = next + 4;
    }

    let mut msg = DnsMessage { id, rcode, ..Default::default() };
    for _ in 0..ancount {
        let (rr, next) = read_record(buf, pos)?;
        msg.answers.push(rr);
        pos = next;
    }
    for _ in 0..nscount {
        let (_, next) = read_record(buf, pos)?;
        pos = next;
    }
    // Glue records are optional; a truncated additional section is not fatal
    for _ in 0..arcount {
        match read_record(buf, pos) {
            Ok((rr, next)) => {
                msg.additional.push(rr);
                pos = next;
            }
            Err(_) => break,
        }
    }

    Ok(msg)
}
