//! RFC 3161 Time Stamping Authority client.
//!
//! Speaks just enough DER to build a `TimeStampReq` for a SHA-256 digest and
//! to walk a `TimeStampResp` far enough to pull out the token, the TSTInfo
//! serial number and the genTime. No default TSA URL is provided; callers
//! must supply one explicitly.

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::RngCore;
use reqwest::Client;
use std::time::Duration;

use crate::{ComplianceError, Result};

/// id-sha256: 2.16.840.1.101.3.4.2.1
const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// A granted timestamp with the fields the compliance log records.
#[derive(Debug, Clone)]
pub struct TimestampResponse {
    /// DER-encoded TimeStampToken (a CMS ContentInfo).
    pub token: Vec<u8>,
    /// TSTInfo serialNumber, hex-encoded (may exceed any machine integer).
    pub serial: String,
    /// TSTInfo genTime.
    pub time: DateTime<Utc>,
    pub tsa_url: String,
}

pub struct TimestampAuthority {
    url: String,
    client: Client,
    timeout: Duration,
    certificate: Option<Vec<u8>>,
    include_tsa_certificate: bool,
}

impl TimestampAuthority {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: Duration::from_secs(30),
            certificate: None,
            include_tsa_certificate: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_certificate(mut self, certificate: Vec<u8>) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request a timestamp for a raw SHA-256 digest (not hex-encoded).
    pub async fn timestamp(&self, digest: &[u8; 32]) -> Result<TimestampResponse> {
        let request = encode_timestamp_request(digest, self.include_tsa_certificate);

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/timestamp-query")
            .body(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ComplianceError::Tsa(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ComplianceError::Tsa(format!(
                "TSA returned HTTP {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ComplianceError::Tsa(e.to_string()))?;

        let token = extract_token(&body)?;
        let tst_info = parse_tst_info(&token)?;

        Ok(TimestampResponse {
            token,
            serial: tst_info.serial_hex,
            time: tst_info.gen_time,
            tsa_url: self.url.clone(),
        })
    }

    /// Re-check a token against a digest.
    ///
    /// The message imprint inside the token's TSTInfo must match `digest`.
    /// When no TSA certificate is configured this digest binding is the
    /// whole check; the CMS signature itself is only validated by the TSA.
    pub fn verify(&self, digest: &[u8; 32], token: &[u8]) -> Result<bool> {
        let tst_info = parse_tst_info(token)?;
        if tst_info.message_imprint != digest[..] {
            return Ok(false);
        }
        if let Some(cert) = &self.certificate {
            // the token must at least embed the signing certificate we trust
            if !contains_subslice(token, cert) && !cert.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// DER encoding
// ---------------------------------------------------------------------------

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else {
        let bytes = (len as u64).to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(7);
        let mut out = vec![0x80 | (8 - first) as u8];
        out.extend_from_slice(&bytes[first..]);
        out
    }
}

fn der_tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&der_len(value.len()));
    out.extend_from_slice(value);
    out
}

fn der_sequence(value: &[u8]) -> Vec<u8> {
    der_tlv(0x30, value)
}

fn der_integer(bytes: &[u8]) -> Vec<u8> {
    // prepend a zero when the high bit would flip the sign
    let mut v = Vec::with_capacity(bytes.len() + 1);
    if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        v.push(0x00);
    }
    v.extend_from_slice(bytes);
    der_tlv(0x02, &v)
}

/// TimeStampReq ::= SEQUENCE { version 1, messageImprint, nonce, certReq }
pub fn encode_timestamp_request(digest: &[u8; 32], cert_req: bool) -> Vec<u8> {
    let algorithm = der_sequence(&{
        let mut v = der_tlv(0x06, OID_SHA256);
        v.extend_from_slice(&der_tlv(0x05, &[])); // NULL params
        v
    });

    let message_imprint = der_sequence(&{
        let mut v = algorithm;
        v.extend_from_slice(&der_tlv(0x04, digest));
        v
    });

    let mut nonce = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut body = der_integer(&[0x01]); // version
    body.extend_from_slice(&message_imprint);
    body.extend_from_slice(&der_integer(&nonce));
    if cert_req {
        body.extend_from_slice(&der_tlv(0x01, &[0xff]));
    }

    der_sequence(&body)
}

// ---------------------------------------------------------------------------
// DER parsing
// ---------------------------------------------------------------------------

/// One TLV element: tag, full span, and the value slice within it.
struct Tlv<'a> {
    tag: u8,
    value: &'a [u8],
    /// bytes consumed including the header
    len: usize,
}

fn read_tlv(data: &[u8]) -> Result<Tlv<'_>> {
    let malformed = |msg: &str| ComplianceError::MalformedToken(msg.to_string());
    if data.len() < 2 {
        return Err(malformed("truncated element"));
    }
    let tag = data[0];
    let first = data[1];
    let (header, len) = if first < 0x80 {
        (2usize, first as usize)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 8 || data.len() < 2 + n {
            return Err(malformed("bad length encoding"));
        }
        let mut len = 0usize;
        for &b in &data[2..2 + n] {
            len = len
                .checked_mul(256)
                .and_then(|l| l.checked_add(b as usize))
                .ok_or_else(|| malformed("length overflow"))?;
        }
        (2 + n, len)
    };
    if data.len() < header + len {
        return Err(malformed("value exceeds buffer"));
    }
    Ok(Tlv {
        tag,
        value: &data[header..header + len],
        len: header + len,
    })
}

/// Split a SEQUENCE/SET value into its child elements.
fn children(value: &[u8]) -> Result<Vec<Tlv<'_>>> {
    let mut out = Vec::new();
    let mut rest = value;
    while !rest.is_empty() {
        let tlv = read_tlv(rest)?;
        let consumed = tlv.len;
        out.push(tlv);
        rest = &rest[consumed..];
    }
    Ok(out)
}

/// TimeStampResp ::= SEQUENCE { status PKIStatusInfo, timeStampToken? }
fn extract_token(resp: &[u8]) -> Result<Vec<u8>> {
    let malformed = |msg: &str| ComplianceError::MalformedToken(msg.to_string());
    let outer = read_tlv(resp)?;
    if outer.tag != 0x30 {
        return Err(malformed("response is not a SEQUENCE"));
    }
    let status_info = read_tlv(outer.value)?;
    let status_parts = children(status_info.value)?;
    let status = status_parts
        .first()
        .filter(|t| t.tag == 0x02)
        .ok_or_else(|| malformed("missing PKIStatus"))?;
    let code = status.value.last().copied().unwrap_or(0xff);
    // 0 = granted, 1 = grantedWithMods
    if code > 1 {
        return Err(ComplianceError::Tsa(format!(
            "timestamp request rejected with PKIStatus {code}"
        )));
    }
    let token_bytes = &outer.value[status_info.len..];
    if token_bytes.is_empty() {
        return Err(malformed("granted response without token"));
    }
    let token = read_tlv(token_bytes)?;
    Ok(token_bytes[..token.len].to_vec())
}

struct TstInfo {
    serial_hex: String,
    gen_time: DateTime<Utc>,
    message_imprint: Vec<u8>,
}

/// Walk ContentInfo -> SignedData -> encapContentInfo -> TSTInfo.
fn parse_tst_info(token: &[u8]) -> Result<TstInfo> {
    let malformed = |msg: &str| ComplianceError::MalformedToken(msg.to_string());

    let content_info = read_tlv(token)?;
    if content_info.tag != 0x30 {
        return Err(malformed("token is not a SEQUENCE"));
    }
    let ci = children(content_info.value)?;
    // ci[0] = contentType OID (signedData), ci[1] = [0] EXPLICIT content
    let explicit = ci
        .get(1)
        .filter(|t| t.tag == 0xa0)
        .ok_or_else(|| malformed("missing signedData content"))?;
    let signed_data = read_tlv(explicit.value)?;
    let sd = children(signed_data.value)?;
    // SignedData ::= SEQUENCE { version, digestAlgorithms, encapContentInfo, ... }
    let encap = sd
        .get(2)
        .filter(|t| t.tag == 0x30)
        .ok_or_else(|| malformed("missing encapContentInfo"))?;
    let ec = children(encap.value)?;
    let econtent = ec
        .get(1)
        .filter(|t| t.tag == 0xa0)
        .ok_or_else(|| malformed("missing eContent"))?;
    let octets = read_tlv(econtent.value)?;
    if octets.tag != 0x04 {
        return Err(malformed("eContent is not an OCTET STRING"));
    }

    // TSTInfo ::= SEQUENCE { version, policy, messageImprint, serialNumber,
    //                        genTime, ... }
    let tst = read_tlv(octets.value)?;
    if tst.tag != 0x30 {
        return Err(malformed("TSTInfo is not a SEQUENCE"));
    }
    let fields = children(tst.value)?;
    let imprint = fields
        .get(2)
        .filter(|t| t.tag == 0x30)
        .ok_or_else(|| malformed("missing messageImprint"))?;
    let imprint_parts = children(imprint.value)?;
    let digest = imprint_parts
        .get(1)
        .filter(|t| t.tag == 0x04)
        .ok_or_else(|| malformed("missing imprint digest"))?;
    let serial = fields
        .get(3)
        .filter(|t| t.tag == 0x02)
        .ok_or_else(|| malformed("missing serialNumber"))?;
    let gen_time = fields
        .get(4)
        .filter(|t| t.tag == 0x18)
        .ok_or_else(|| malformed("missing genTime"))?;

    Ok(TstInfo {
        serial_hex: hex::encode(serial.value),
        gen_time: parse_generalized_time(gen_time.value)?,
        message_imprint: digest.value.to_vec(),
    })
}

/// GeneralizedTime is `YYYYMMDDHHMMSS[.fff]Z` for RFC 3161 tokens.
fn parse_generalized_time(raw: &[u8]) -> Result<DateTime<Utc>> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ComplianceError::MalformedToken("genTime is not ascii".to_string()))?;
    let trimmed = text.trim_end_matches('Z');
    let base = trimmed.split('.').next().unwrap_or(trimmed);
    let naive = NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .map_err(|e| ComplianceError::MalformedToken(format!("bad genTime: {e}")))?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
