use crate::error::ConnectionError;
use std::fmt;

/// Network flavour selected by the URL scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
    Tcp,
    Tls,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

/// A validated broker endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerUrl {
    raw: String,
    scheme: Scheme,
    host: String,
    port: u16,
}

impl BrokerUrl {
    pub fn parse(url: &str) -> Result<Self, ConnectionError> {
        let invalid = || ConnectionError::InvalidUrl(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            "tcp" | "mqtt" => Scheme::Tcp,
            "ssl" | "tls" | "mqtts" => Scheme::Tls,
            _ => return Err(invalid()),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, scheme.default_port()),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(BrokerUrl {
            raw: url.to_string(),
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_websocket_endpoint() {
        let url = BrokerUrl::parse("ws://localhost:8008/mqtt").unwrap();
        assert_eq!(url.scheme(), Scheme::Ws);
        assert_eq!(url.host(), "localhost");
        assert_eq!(url.port(), 8008);
    }

    #[test]
    fn falls_back_to_default_port() {
        let url = BrokerUrl::parse("mqtts://broker.example.com").unwrap();
        assert_eq!(url.scheme(), Scheme::Tls);
        assert_eq!(url.port(), 8883);
    }

    #[test]
    fn rejects_unknown_scheme_and_missing_host() {
        assert!(matches!(
            BrokerUrl::parse("http://localhost"),
            Err(ConnectionError::InvalidUrl(_))
        ));
        assert!(BrokerUrl::parse("localhost:1883").is_err());
        assert!(BrokerUrl::parse("tcp://:1883").is_err());
        assert!(BrokerUrl::parse("tcp://host:port").is_err());
    }
}
