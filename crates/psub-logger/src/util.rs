// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions shared by the bus components.

use std::fmt::Write;

use crate::constants::DEFAULT_BUS_PORT;

const HEX_DUMP_WIDTH: usize = 16;

/// Splits a bus address into host and port.
///
/// The port defaults to [`DEFAULT_BUS_PORT`] when the address carries none.
/// Whitespace is trimmed from the input.
///
/// # Returns
///
/// * `Some((host, port))` - if the address is usable
/// * `None` - if the host is empty or the port is not a number
///
/// # Examples
///
/// ```
/// use psub_logger::util::parse_bus_address;
///
/// assert_eq!(parse_bus_address("10.0.0.2"), Some(("10.0.0.2".to_string(), 3101)));
/// assert_eq!(parse_bus_address("bus.local:4000"), Some(("bus.local".to_string(), 4000)));
/// assert_eq!(parse_bus_address("bus.local:port"), None);
/// ```
pub fn parse_bus_address(address: &str) -> Option<(String, u16)> {
    let trimmed = address.trim();
    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (trimmed, DEFAULT_BUS_PORT),
    };
    if host.is_empty() {
        tracing::error!("Bus address '{}' has no host", trimmed);
        return None;
    }
    Some((host.to_string(), port))
}

/// Renders bytes as an offset / hex / printable-character dump, sixteen bytes per line.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = format!("Dumping buffer contents ({} bytes):\n", bytes.len());
    for (line, chunk) in bytes.chunks(HEX_DUMP_WIDTH).enumerate() {
        let mut hex = String::new();
        let mut text = String::new();
        for (i, byte) in chunk.iter().enumerate() {
            let _ = write!(hex, " {byte:02X}");
            if (i + 1) % 4 == 0 {
                hex.push(' ');
            }
            text.push(if byte.is_ascii_graphic() || *byte == b' ' {
                char::from(*byte)
            } else {
                '.'
            });
        }
        let _ = writeln!(
            out,
            "{:>5X}  {:<width$}  {}",
            line * HEX_DUMP_WIDTH,
            hex,
            text,
            width = HEX_DUMP_WIDTH * 3 + HEX_DUMP_WIDTH / 4
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bus_address() {
        assert_eq!(
            parse_bus_address(" 127.0.0.1 "),
            Some(("127.0.0.1".to_string(), 3101))
        );
        assert_eq!(
            parse_bus_address("bus:3200"),
            Some(("bus".to_string(), 3200))
        );
        assert_eq!(parse_bus_address(":3200"), None);
        assert_eq!(parse_bus_address(""), None);
        assert_eq!(parse_bus_address("bus:99999"), None);
    }

    #[test]
    fn test_hex_dump_layout() {
        let dump = hex_dump(b"ABCD\x00\x01efghijklmnopq");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "Dumping buffer contents (21 bytes):");
        assert!(lines[1].starts_with("    0   41 42 43 44  00 01 65 66 "));
        assert!(lines[1].ends_with("ABCD..efghijklmn"));
        assert!(lines[2].starts_with("   10   6F 70 71"));
        assert!(lines[2].ends_with("opq"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_hex_dump_empty() {
        assert_eq!(hex_dump(&[]), "Dumping buffer contents (0 bytes):\n");
    }
}
