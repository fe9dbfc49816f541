//! Port → service class lookup.
//!
//! A small built-in registry of well-known TCP service names, used to
//! bucket persisted artifacts by directory. Unknown ports fall back to a
//! payload sniff: `utf8` for text-looking conversations, `unknown`
//! otherwise.

use std::collections::HashMap;

lazy_static! {
    static ref TCP_SERVICES: HashMap<u16, &'static str> = hashmap! {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "domain",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        443 => "https",
        465 => "smtps",
        587 => "submission",
        993 => "imaps",
        995 => "pop3s",
        1433 => "ms-sql-s",
        3306 => "mysql",
        3389 => "ms-wbt-server",
        5432 => "postgresql",
        5900 => "vnc",
        6379 => "redis",
        8080 => "http-alt",
        9200 => "wap-wsp",
        11211 => "memcache",
        27017 => "mongodb",
    };
}

/// Returns the registered service name for `port`, if any. Only the
/// `"tcp"` table is populated.
pub fn lookup_service(port: u16, proto: &str) -> Option<&'static str> {
    match proto {
        "tcp" => TCP_SERVICES.get(&port).copied(),
        _ => None,
    }
}

/// Directory class for persisted artifacts: the registered service name
/// for the server port, else `utf8`/`unknown` by payload sniff.
pub fn service_class(port: u16, payload: &[u8]) -> &'static str {
    if let Some(name) = lookup_service(port, "tcp") {
        return name;
    }
    if std::str::from_utf8(payload).is_ok() {
        "utf8"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ports_resolve() {
        assert_eq!(lookup_service(21, "tcp"), Some("ftp"));
        assert_eq!(lookup_service(443, "tcp"), Some("https"));
        assert_eq!(lookup_service(21, "udp"), None);
        assert_eq!(lookup_service(49152, "tcp"), None);
    }

    #[test]
    fn unknown_ports_sniff_payload() {
        assert_eq!(service_class(80, b"\xff\xfe"), "http");
        assert_eq!(service_class(49152, b"hello\r\n"), "utf8");
        assert_eq!(service_class(49152, b"\xff\xfe\x00\x01"), "unknown");
    }
}
