//! TLS certificate probe.
//!
//! Completes a handshake without verifying the chain, then reads the validity
//! window straight out of the leaf certificate's DER encoding.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, NaiveDateTime, Utc};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::{CheckError, RawResult};
use crate::db::SslSettings;

/// Accepts every certificate. Expiry is judged from the validity window, not
/// by the handshake.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Connect to `host:port` and report the leaf certificate's remaining life.
pub async fn run_ssl_check(settings: &SslSettings, timeout: Duration) -> Result<RawResult, CheckError> {
    let server_name = ServerName::try_from(settings.host.as_str())
        .map_err(|e| CheckError::Config(format!("invalid server name {}: {}", settings.host, e)))?;

    let start = Instant::now();
    let handshake = async {
        let stream = TcpStream::connect((settings.host.as_str(), settings.port))
            .await
            .map_err(|e| CheckError::Network(format!("failed to connect: {}", e)))?;
        connector()
            .connect(server_name, stream)
            .await
            .map_err(|e| CheckError::Tls(e.to_string()))
    };
    let tls = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| CheckError::Timeout(timeout))??;
    let response_time = start.elapsed().as_secs_f64() * 1000.0;

    let (_, session) = tls.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| CheckError::Tls("server presented no certificate".to_string()))?;

    let (not_before, not_after) = parse_validity(&leaf.0)
        .ok_or_else(|| CheckError::Tls("unable to read certificate validity".to_string()))?;

    let now = Utc::now();
    tracing::debug!(host = %settings.host, %not_after, "certificate read");

    Ok(RawResult::Certificate {
        valid: not_before <= now && now <= not_after,
        hours_remaining: (not_after - now).num_hours(),
        response_time,
    })
}

/// Split one DER element into (tag, contents, remainder).
fn read_tlv(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let tag = *buf.first()?;
    let first = *buf.get(1)? as usize;

    let (len, header) = if first < 0x80 {
        (first, 2)
    } else {
        let octets = first & 0x7F;
        if octets == 0 || octets > 4 {
            return None;
        }
        let len = buf
            .get(2..2 + octets)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, 2 + octets)
    };

    let contents = buf.get(header..header + len)?;
    Some((tag, contents, &buf[header + len..]))
}

/// Extract (notBefore, notAfter) from an X.509 certificate.
pub(crate) fn parse_validity(der: &[u8]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (0x30, cert, _) = read_tlv(der)? else { return None };
    let (0x30, tbs, _) = read_tlv(cert)? else { return None };

    // Optional explicit version, then serial number
    let (tag, _, mut rest) = read_tlv(tbs)?;
    if tag == 0xA0 {
        rest = read_tlv(rest)?.2;
    }
    // signature algorithm, issuer
    rest = read_tlv(rest)?.2;
    rest = read_tlv(rest)?.2;

    let (0x30, validity, _) = read_tlv(rest)? else { return None };
    let (t1, not_before, rest) = read_tlv(validity)?;
    let (t2, not_after, _) = read_tlv(rest)?;

    Some((parse_time(t1, not_before)?, parse_time(t2, not_after)?))
}

fn parse_time(tag: u8, raw: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(raw).ok()?.trim_end_matches('Z');
    let full = match tag {
        // UTCTime: two-digit year, 50..99 means 19xx
        0x17 => {
            let yy: u32 = text.get(0..2)?.parse().ok()?;
            let century = if yy >= 50 { "19" } else { "20" };
            format!("{}{}", century, text)
        }
        0x18 => text.to_string(),
        _ => return None,
    };
    NaiveDateTime::parse_from_str(&full, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        if contents.len() < 0x80 {
            out.push(contents.len() as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(contents.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(contents);
        out
    }

    fn certificate(not_before: (u8, &str), not_after: (u8, &str)) -> Vec<u8> {
        let validity = [tlv(not_before.0, not_before.1.as_bytes()), tlv(not_after.0, not_after.1.as_bytes())].concat();
        // A long issuer forces the multi-byte length form.
        let issuer = tlv(0x30, &[0x55; 200]);
        let tbs = [
            tlv(0xA0, &tlv(0x02, &[2])),
            tlv(0x02, &[0x01, 0x23]),
            tlv(0x30, &[]),
            issuer,
            tlv(0x30, &validity),
            tlv(0x30, &[]),
        ]
        .concat();
        tlv(0x30, &[tlv(0x30, &tbs), tlv(0x30, &[])].concat())
    }

    #[test]
    fn test_parse_validity_mixed_time_formats() {
        let der = certificate((0x17, "250101000000Z"), (0x18, "20300601120000Z"));
        let (nb, na) = parse_validity(&der).unwrap();
        assert_eq!(nb, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(na, Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_utctime_century() {
        assert_eq!(
            parse_time(0x17, b"990101000000Z").unwrap(),
            Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_time(0x04, b"990101000000Z").is_none());
    }

    #[test]
    fn test_parse_validity_rejects_garbage() {
        assert!(parse_validity(&[0x30, 0x05, 0x01]).is_none());
        assert!(parse_validity(&[]).is_none());
    }

    #[tokio::test]
    async fn test_ssl_check_connection_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let settings = SslSettings {
            host: "localhost".to_string(),
            port,
            degraded_remaining_hours: 168,
            down_remaining_hours: 24,
            timeout_ms: None,
        };
        let result = run_ssl_check(&settings, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(CheckError::Network(_))));
    }
}
