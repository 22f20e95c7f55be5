use bytes::Bytes;

/// ALPN protocol negotiated (or offered) on a TLS connection. The core only ever
/// speaks HTTP/1.1 end to end, but the interceptor still needs to recognize what
/// a client offered so it can refuse anything it can't serve.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum AlpnProtocol {
    Http1,
    Unknown(Bytes),
    #[default]
    None,
}

const ALPN_H11: &[u8] = b"http/1.1";

impl AlpnProtocol {
    pub fn to_bytes(&self) -> &[u8] {
        match self {
            AlpnProtocol::Http1 => ALPN_H11,
            AlpnProtocol::Unknown(bytes) => bytes,
            AlpnProtocol::None => &[],
        }
    }

    pub fn from_bytes_opt(alpn: Option<&[u8]>) -> Self {
        match alpn {
            Some(bytes) => AlpnProtocol::from_bytes(bytes),
            None => AlpnProtocol::None,
        }
    }

    pub fn from_bytes(alpn: &[u8]) -> Self {
        match alpn {
            ALPN_H11 => AlpnProtocol::Http1,
            _ => AlpnProtocol::Unknown(Bytes::from(alpn.to_owned())),
        }
    }
}

pub fn alp_h1() -> Vec<Vec<u8>> {
    vec![ALPN_H11.to_vec()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_recognizes_http1() {
        assert_eq!(AlpnProtocol::from_bytes(b"http/1.1"), AlpnProtocol::Http1);
    }

    #[test]
    fn unknown_protocol_is_preserved() {
        let raw = b"h2";
        let p = AlpnProtocol::from_bytes(raw);
        assert_eq!(p.to_bytes(), raw);
        assert!(matches!(p, AlpnProtocol::Unknown(_)));
    }

    #[test]
    fn from_bytes_opt_handles_none() {
        assert_eq!(AlpnProtocol::from_bytes_opt(None), AlpnProtocol::None);
    }
}
