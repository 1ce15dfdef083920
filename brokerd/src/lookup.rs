//! Service addresses and the protocol -> backend lookup table.
//!
//! A client addresses a request as `proto://host[:port]/path`. The broker
//! resolves the protocol against its configured service table; the resolved
//! port is canonical and overrides whatever the client supplied.

use std::collections::HashMap;
use std::fmt;

use crate::config::ServiceEntry;
use crate::error::BrokerError;

/// A parsed service address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl ServiceAddress {
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        let (protocol, rest) = raw
            .split_once("://")
            .ok_or_else(|| BrokerError::Protocol(format!("not a service address: '{}'", raw)))?;
        if protocol.is_empty() {
            return Err(BrokerError::Protocol(format!(
                "empty protocol in address '{}'",
                raw
            )));
        }

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, format!("/{}", path)),
            None => (rest, String::new()),
        };

        let (host, port) = match authority.split_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    BrokerError::Protocol(format!("invalid port '{}' in address '{}'", port_str, raw))
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };

        let host = if host.is_empty() { "localhost" } else { host };

        Ok(Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            path,
        })
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.path)
    }
}

/// What an address resolves to: the executable to run and the canonical
/// port it must be listening on.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub executable: String,
    pub port: u16,
    pub debug: bool,
    pub secure: bool,
    pub read_only: bool,
}

/// Protocol -> backend resolution table, built from configuration once at
/// startup and read-only afterwards.
#[derive(Debug, Default)]
pub struct Lookup {
    services: HashMap<String, ResolvedService>,
}

impl Lookup {
    pub fn new(services: &HashMap<String, ServiceEntry>) -> Self {
        let services = services
            .iter()
            .map(|(protocol, entry)| {
                (
                    protocol.clone(),
                    ResolvedService {
                        executable: entry.executable.clone(),
                        port: entry.port,
                        debug: entry.debug,
                        secure: entry.secure,
                        read_only: entry.read_only,
                    },
                )
            })
            .collect();
        Self { services }
    }

    pub fn resolve(&self, address: &ServiceAddress) -> Result<ResolvedService, BrokerError> {
        self.services
            .get(&address.protocol)
            .cloned()
            .ok_or_else(|| BrokerError::Lookup(address.protocol.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResultCode;

    fn table() -> Lookup {
        let mut services = HashMap::new();
        services.insert(
            "mdvp".to_string(),
            ServiceEntry {
                executable: "mdv-server".to_string(),
                port: 5440,
                debug: false,
                secure: false,
                read_only: true,
            },
        );
        Lookup::new(&services)
    }

    #[test]
    fn parses_full_address() {
        let addr = ServiceAddress::parse("mdvp://radar-host:9999/mosaic/national").unwrap();
        assert_eq!(addr.protocol, "mdvp");
        assert_eq!(addr.host, "radar-host");
        assert_eq!(addr.port, Some(9999));
        assert_eq!(addr.path, "/mosaic/national");
        assert_eq!(addr.to_string(), "mdvp://radar-host:9999/mosaic/national");
    }

    #[test]
    fn parses_address_without_port() {
        let addr = ServiceAddress::parse("spdbp://localhost/metars").unwrap();
        assert_eq!(addr.port, None);
        assert_eq!(addr.path, "/metars");
    }

    #[test]
    fn empty_host_defaults_to_localhost() {
        let addr = ServiceAddress::parse("mdvp:///mosaic").unwrap();
        assert_eq!(addr.host, "localhost");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(ServiceAddress::parse("no-scheme-here").is_err());
        assert!(ServiceAddress::parse("://host/path").is_err());
        assert!(ServiceAddress::parse("mdvp://host:not-a-port/path").is_err());
    }

    #[test]
    fn resolves_known_protocol() {
        let addr = ServiceAddress::parse("mdvp://localhost/mosaic").unwrap();
        let resolved = table().resolve(&addr).unwrap();
        assert_eq!(resolved.executable, "mdv-server");
        assert_eq!(resolved.port, 5440);
        assert!(resolved.read_only);
    }

    #[test]
    fn unknown_protocol_maps_to_no_service() {
        let addr = ServiceAddress::parse("bogus://localhost/x").unwrap();
        let err = table().resolve(&addr).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::NoServiceAvailable);
    }

    #[test]
    fn canonical_port_overrides_client_port() {
        let mut addr = ServiceAddress::parse("mdvp://localhost:9999/mosaic").unwrap();
        let resolved = table().resolve(&addr).unwrap();
        addr.set_port(resolved.port);
        assert_eq!(addr.to_string(), "mdvp://localhost:5440/mosaic");
    }
}
