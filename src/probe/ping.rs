//! Ping probe implementation with native ICMP and command fallback.
//!
//! Each echo runs as a blocking socket call in `spawn_blocking` so timing is
//! not skewed by the async scheduler.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{CheckError, ProbeOutcome, ProbeState, RawResult};
use crate::db::PingSettings;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Per-family ICMP parameters.
struct IcmpFamily {
    domain: Domain,
    protocol: Protocol,
    echo_request: u8,
    echo_reply: u8,
    /// ICMPv6 checksums are filled in by the kernel.
    compute_checksum: bool,
}

const ICMP_V4: IcmpFamily = IcmpFamily {
    domain: Domain::IPV4,
    protocol: Protocol::ICMPV4,
    echo_request: 8,
    echo_reply: 0,
    compute_checksum: true,
};

const ICMP_V6: IcmpFamily = IcmpFamily {
    domain: Domain::IPV6,
    protocol: Protocol::ICMPV6,
    echo_request: 128,
    echo_reply: 129,
    compute_checksum: false,
};

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Send `count` echo requests to the monitor's host, one after another.
///
/// A host that does not resolve is a configuration/network error; individual
/// lost echoes are reported per probe.
pub async fn run_ping_check(settings: &PingSettings, timeout: Duration) -> Result<RawResult, CheckError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    let count = settings.count.max(1);
    let mut outcomes = Vec::with_capacity(count as usize);

    let ip = resolve_address(&settings.host).await?;

    for _ in 0..count {
        let result = match capability {
            IcmpCapability::Native => match ping_native(ip, timeout).await {
                Err(CheckError::Network(msg)) if is_permission_error(&msg) => {
                    tracing::warn!(host = %settings.host, "native ping not permitted, falling back to command: {}", msg);
                    ping_command(&ip.to_string(), timeout).await
                }
                other => other,
            },
            IcmpCapability::CommandOnly => ping_command(&ip.to_string(), timeout).await,
        };

        outcomes.push(match result {
            Ok(ms) => ProbeOutcome { state: ProbeState::Open, latency: ms },
            Err(CheckError::Timeout(t)) => ProbeOutcome {
                state: ProbeState::Timeout,
                latency: t.as_secs_f64() * 1000.0,
            },
            Err(e) => {
                tracing::debug!(host = %settings.host, "ping attempt failed: {}", e);
                ProbeOutcome { state: ProbeState::Error, latency: 0.0 }
            }
        });
    }

    Ok(RawResult::Probes(outcomes))
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve hostname to IP address.
pub(crate) async fn resolve_address(address: &str) -> Result<IpAddr, CheckError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| CheckError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| CheckError::Network(format!("No addresses found for {}", address)))
}

async fn ping_native(ip: IpAddr, timeout: Duration) -> Result<f64, CheckError> {
    tokio::task::spawn_blocking(move || echo_blocking(ip, timeout))
        .await
        .map_err(|e| CheckError::Network(format!("spawn_blocking failed: {}", e)))?
}

/// One ICMP echo round trip in milliseconds.
fn echo_blocking(ip: IpAddr, timeout: Duration) -> Result<f64, CheckError> {
    let family = match ip {
        IpAddr::V4(_) => &ICMP_V4,
        IpAddr::V6(_) => &ICMP_V6,
    };

    // RAW first (privileged), then DGRAM (unprivileged)
    let socket = Socket::new(family.domain, Type::RAW, Some(family.protocol))
        .or_else(|_| Socket::new(family.domain, Type::DGRAM, Some(family.protocol)))
        .map_err(|e| CheckError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| CheckError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| CheckError::Network(format!("Failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(family, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            CheckError::Network(format!("Permission denied: {}", e))
        } else {
            CheckError::Network(format!("Failed to send: {}", e))
        }
    })?;

    let mut reader = &socket;
    let mut buf = [0u8; 1500];
    // Loop until our reply arrives or the timeout passes
    loop {
        let len = reader.read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => CheckError::Timeout(timeout),
            _ => CheckError::Network(format!("Failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(CheckError::Timeout(timeout));
        }

        if is_matching_reply(family, &buf[..len], identifier, sequence) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
    }
}

fn is_matching_reply(family: &IcmpFamily, buf: &[u8], identifier: u16, sequence: u16) -> bool {
    // RAW IPv4 sockets deliver the IP header too
    let offset = if family.compute_checksum && !buf.is_empty() && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0F) as usize) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }
    let icmp = &buf[offset..];
    icmp[0] == family.echo_reply
        && u16::from_be_bytes([icmp[4], icmp[5]]) == identifier
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Build an ICMP Echo Request: 8 byte header plus 56 byte payload.
fn build_echo_request(family: &IcmpFamily, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = family.echo_request;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if family.compute_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Run ping via command execution (fallback). Returns milliseconds.
async fn ping_command(address: &str, timeout: Duration) -> Result<f64, CheckError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CheckError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(CheckError::Timeout(timeout));
        }
        return Err(CheckError::Command(format!("ping failed: {}", stdout)));
    }

    parse_ping_output(&stdout)
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, CheckError> {
    static PATTERNS: OnceLock<Vec<(Regex, usize)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // Per-packet "time=X.XXX ms" (Linux, macOS)
            (r"time[=<]([0-9.]+)\s*ms", 1),
            // "round-trip min/avg/max/stddev = a/b/c/d ms" (macOS)
            (r"round-trip\s+min/avg/max/stddev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
            // "rtt min/avg/max/mdev = a/b/c/d ms" (Linux)
            (r"rtt\s+min/avg/max/mdev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
        ]
        .into_iter()
        .filter_map(|(re, group)| Regex::new(re).ok().map(|r| (r, group)))
        .collect()
    });

    patterns
        .iter()
        .find_map(|(re, group)| {
            re.captures(output)
                .and_then(|caps| caps.get(*group))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        })
        .ok_or_else(|| CheckError::Command(format!("failed to parse ping output: {}", output)))
}
