/// Minimal STUN Binding codec (RFC 5389): just enough to learn a mapped address
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::domain::shared::ReachError;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

pub type TransactionId = [u8; 12];

pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

/// Encode a Binding Request carrying a SOFTWARE attribute
pub fn binding_request(transaction_id: &TransactionId, software: &str) -> Bytes {
    let mut attrs = BytesMut::new();
    put_attribute(&mut attrs, ATTR_SOFTWARE, software.as_bytes());

    let mut buf = BytesMut::with_capacity(HEADER_LEN + attrs.len());
    put_header(&mut buf, BINDING_REQUEST, attrs.len(), transaction_id);
    buf.put(attrs);
    buf.freeze()
}

/// Encode a Binding success response with XOR-MAPPED-ADDRESS.
///
/// Used by the loopback responder in tests and diagnostics.
pub fn binding_response(transaction_id: &TransactionId, mapped: SocketAddr) -> Bytes {
    let mut value = BytesMut::new();
    value.put_u8(0);
    let port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match mapped.ip() {
        IpAddr::V4(ip) => {
            value.put_u8(FAMILY_V4);
            value.put_u16(port);
            value.put_u32(u32::from(ip) ^ MAGIC_COOKIE);
        }
        IpAddr::V6(ip) => {
            value.put_u8(FAMILY_V6);
            value.put_u16(port);
            let key = xor_key(transaction_id);
            for (octet, k) in ip.octets().iter().zip(key.iter()) {
                value.put_u8(octet ^ k);
            }
        }
    }

    let mut attrs = BytesMut::new();
    put_attribute(&mut attrs, ATTR_XOR_MAPPED_ADDRESS, &value);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + attrs.len());
    put_header(&mut buf, BINDING_SUCCESS, attrs.len(), transaction_id);
    buf.put(attrs);
    buf.freeze()
}

/// Decoded Binding Request header, for responders
pub fn parse_request(data: &[u8]) -> Result<TransactionId, ReachError> {
    let (kind, transaction_id, _) = parse_header(data)?;
    if kind != BINDING_REQUEST {
        return Err(ReachError::Probe(format!("not a binding request: {:#06x}", kind)));
    }
    Ok(transaction_id)
}

/// Extract the mapped address from a Binding response to `expected`
pub fn parse_response(data: &[u8], expected: &TransactionId) -> Result<SocketAddr, ReachError> {
    let (kind, transaction_id, mut attrs) = parse_header(data)?;
    if &transaction_id != expected {
        return Err(ReachError::Probe("transaction ID mismatch".to_string()));
    }
    if kind != BINDING_SUCCESS && kind != BINDING_ERROR {
        return Err(ReachError::Probe(format!("unexpected message type {:#06x}", kind)));
    }

    let mut xor_mapped = None;
    let mut mapped = None;
    let mut error = None;

    while attrs.remaining() >= 4 {
        let attr_type = attrs.get_u16();
        let attr_len = attrs.get_u16() as usize;
        if attrs.remaining() < attr_len {
            return Err(ReachError::Probe("truncated attribute".to_string()));
        }
        let value = &attrs[..attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = decode_address(value, Some(&transaction_id)),
            ATTR_MAPPED_ADDRESS => mapped = decode_address(value, None),
            ATTR_ERROR_CODE if value.len() >= 4 => {
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                error = Some((code, reason));
            }
            _ => {}
        }
        let padded = (attr_len + 3) & !3;
        attrs.advance(padded.min(attrs.remaining()));
    }

    if kind == BINDING_ERROR {
        let (code, reason) = error.unwrap_or((0, "no ERROR-CODE".to_string()));
        return Err(ReachError::Probe(format!("server error {} {}", code, reason)));
    }

    xor_mapped
        .or(mapped)
        .ok_or_else(|| ReachError::Probe("no mapped address in response".to_string()))
}

fn put_header(buf: &mut BytesMut, kind: u16, len: usize, transaction_id: &TransactionId) {
    buf.put_u16(kind);
    buf.put_u16(len as u16);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id);
}

fn put_attribute(buf: &mut BytesMut, attr_type: u16, value: &[u8]) {
    buf.put_u16(attr_type);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    let padding = (4 - value.len() % 4) % 4;
    buf.put_bytes(0, padding);
}

fn parse_header(data: &[u8]) -> Result<(u16, TransactionId, &[u8]), ReachError> {
    if data.len() < HEADER_LEN {
        return Err(ReachError::Probe("message too short".to_string()));
    }
    let mut header = &data[..HEADER_LEN];
    let kind = header.get_u16();
    let len = header.get_u16() as usize;
    if header.get_u32() != MAGIC_COOKIE {
        return Err(ReachError::Probe("invalid magic cookie".to_string()));
    }
    let mut transaction_id = [0u8; 12];
    header.copy_to_slice(&mut transaction_id);

    let body = &data[HEADER_LEN..];
    if body.len() < len {
        return Err(ReachError::Probe("truncated message".to_string()));
    }
    Ok((kind, transaction_id, &body[..len]))
}

fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn decode_address(mut value: &[u8], xor_with: Option<&TransactionId>) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    value.advance(1);
    let family = value.get_u8();
    let mut port = value.get_u16();
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        FAMILY_V4 => {
            let mut raw = value.get_u32();
            if xor_with.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        FAMILY_V6 if value.len() >= 16 => {
            let mut octets = [0u8; 16];
            value.copy_to_slice(&mut octets);
            if let Some(transaction_id) = xor_with {
                for (octet, k) in octets.iter_mut().zip(xor_key(transaction_id).iter()) {
                    *octet ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header() {
        let tid = new_transaction_id();
        let bytes = binding_request(&tid, "sipreach");

        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(parse_request(&bytes).unwrap(), tid);
    }

    #[test]
    fn test_xor_mapped_v4() {
        let tid = new_transaction_id();
        let mapped: SocketAddr = "203.0.113.7:40123".parse().unwrap();
        let response = binding_response(&tid, mapped);
        assert_eq!(parse_response(&response, &tid).unwrap(), mapped);
    }

    #[test]
    fn test_xor_mapped_v6() {
        let tid = new_transaction_id();
        let mapped: SocketAddr = "[2001:db8::7]:40123".parse().unwrap();
        let response = binding_response(&tid, mapped);
        assert_eq!(parse_response(&response, &tid).unwrap(), mapped);
    }

    #[test]
    fn test_transaction_mismatch() {
        let response = binding_response(&[1u8; 12], "203.0.113.7:1".parse().unwrap());
        assert!(parse_response(&response, &[2u8; 12]).is_err());
    }

    #[test]
    fn test_plain_mapped_address() {
        let tid = [7u8; 12];
        let mut value = BytesMut::new();
        value.put_u8(0);
        value.put_u8(FAMILY_V4);
        value.put_u16(5060);
        value.put_slice(&[192, 0, 2, 1]);
        let mut attrs = BytesMut::new();
        put_attribute(&mut attrs, ATTR_MAPPED_ADDRESS, &value);
        let mut buf = BytesMut::new();
        put_header(&mut buf, BINDING_SUCCESS, attrs.len(), &tid);
        buf.put(attrs);

        assert_eq!(
            parse_response(&buf, &tid).unwrap(),
            "192.0.2.1:5060".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_error_response() {
        let tid = [3u8; 12];
        let mut value = BytesMut::new();
        value.put_u16(0);
        value.put_u8(4);
        value.put_u8(20);
        value.put_slice(b"Unknown");
        let mut attrs = BytesMut::new();
        put_attribute(&mut attrs, ATTR_ERROR_CODE, &value);
        let mut buf = BytesMut::new();
        put_header(&mut buf, BINDING_ERROR, attrs.len(), &tid);
        buf.put(attrs);

        let err = parse_response(&buf, &tid).unwrap_err();
        assert_eq!(err, ReachError::Probe("server error 420 Unknown".to_string()));
    }

    #[test]
    fn test_short_message() {
        assert!(parse_response(&[0u8; 8], &[0u8; 12]).is_err());
    }
}
