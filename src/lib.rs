pub mod checks;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod sender;
pub mod storage;
pub mod tagger;

/// Common types used across modules
pub mod types {
    use std::fmt;
    use std::str::FromStr;

    use chrono::{DateTime, Utc};
    use serde::Deserialize;

    use crate::error::EndpointError;

    /// Facts captured once per invocation and handed to every phase.
    #[derive(Debug, Clone)]
    pub struct RunContext {
        pub started_at: DateTime<Utc>,
        pub hostname: String,
    }

    impl RunContext {
        pub fn new(started_at: DateTime<Utc>, hostname: impl Into<String>) -> Self {
            Self {
                started_at,
                hostname: hostname.into(),
            }
        }

        /// Snapshot the wall clock now.
        pub fn capture(hostname: impl Into<String>) -> Self {
            Self::new(Utc::now(), hostname)
        }

        /// Unix seconds used to name every chunk created during this run.
        pub fn timestamp(&self) -> i64 {
            self.started_at.timestamp()
        }
    }

    /// A TSD address, `host:port`.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
    #[serde(try_from = "String")]
    pub struct Endpoint {
        pub host: String,
        pub port: u16,
    }

    impl Endpoint {
        pub fn new(host: impl Into<String>, port: u16) -> Self {
            Self {
                host: host.into(),
                port,
            }
        }
    }

    impl FromStr for Endpoint {
        type Err = EndpointError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let input = s.trim();
            let invalid = |reason| EndpointError {
                input: input.to_string(),
                reason,
            };

            let (host, port) = input.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
            let host = match host.strip_prefix('[') {
                Some(rest) => rest.strip_suffix(']').ok_or_else(|| invalid("unbalanced brackets"))?,
                None if host.contains(':') => return Err(invalid("IPv6 hosts must be bracketed")),
                None => host,
            };
            if host.is_empty() {
                return Err(invalid("empty host"));
            }
            let port = port.parse::<u16>().map_err(|_| invalid("port is not a number in 0-65535"))?;

            Ok(Self::new(host, port))
        }
    }

    impl TryFrom<String> for Endpoint {
        type Error = EndpointError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            value.parse()
        }
    }

    impl fmt::Display for Endpoint {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.host.contains(':') {
                write!(f, "[{}]:{}", self.host, self.port)
            } else {
                write!(f, "{}:{}", self.host, self.port)
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_host_and_port() {
            let ep: Endpoint = "tsd1.example.com:4242".parse().unwrap();
            assert_eq!(ep, Endpoint::new("tsd1.example.com", 4242));
            assert_eq!(ep.to_string(), "tsd1.example.com:4242");
        }

        #[test]
        fn parses_bracketed_ipv6() {
            let ep: Endpoint = " [::1]:4242 ".parse().unwrap();
            assert_eq!(ep.host, "::1");
            assert_eq!(ep.to_string(), "[::1]:4242");
        }

        #[test]
        fn rejects_malformed_endpoints() {
            for bad in ["tsd1", ":4242", "tsd1:http", "tsd1:70000", "::1:4242", "[::1:4242"] {
                assert!(bad.parse::<Endpoint>().is_err(), "{bad} should not parse");
            }
        }

        #[test]
        fn run_timestamp_is_whole_seconds() {
            let started = DateTime::from_timestamp(1_700_000_000, 999_000_000).unwrap();
            let ctx = RunContext::new(started, "web-01");
            assert_eq!(ctx.timestamp(), 1_700_000_000);
        }
    }
}
