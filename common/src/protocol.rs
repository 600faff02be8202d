use crate::{address::HardwareAddress, error::Result};

pub const WAKE_PORT: u16 = 9;
pub const HEARTBEAT_PORT: u16 = 40_000;
pub const SHUTDOWN_PORT: u16 = HEARTBEAT_PORT;

pub const WAKE_PACKET_LEN: usize = 102;
const WAKE_HEADER_LEN: usize = 6;
const WAKE_REPETITIONS: usize = 16;

pub const HEARTBEAT_PREFIX: &str = "HEARTBEAT|";
pub const SHUTDOWN_PREFIX: &str = "SHUTDOWN_ESP|";

pub const MAX_DATAGRAM_LEN: usize = 128;

pub trait DatagramTransport: Send + Sync {
    fn send_broadcast(&self, port: u16, payload: &[u8]) -> Result<usize>;
}

pub fn build_wake_packet(address: &HardwareAddress) -> [u8; WAKE_PACKET_LEN] {
    let mut packet = [0xFF_u8; WAKE_PACKET_LEN];
    for chunk in packet[WAKE_HEADER_LEN..].chunks_exact_mut(HardwareAddress::LEN) {
        chunk.copy_from_slice(address.as_bytes());
    }
    debug_assert_eq!(
        WAKE_HEADER_LEN + WAKE_REPETITIONS * HardwareAddress::LEN,
        WAKE_PACKET_LEN
    );
    packet
}

pub fn build_shutdown_payload(address: &HardwareAddress) -> String {
    format!("{SHUTDOWN_PREFIX}{}", address.to_hex())
}

pub fn build_heartbeat_payload(address: &HardwareAddress) -> String {
    format!("{HEARTBEAT_PREFIX}{}", address.to_hex())
}

// Returns the source address text of a heartbeat datagram, trimmed of
// trailing whitespace and NUL padding. The text itself is not validated.
pub fn parse_heartbeat(datagram: &[u8]) -> Option<&str> {
    strip_prefix(datagram, HEARTBEAT_PREFIX)
}

pub fn parse_shutdown(datagram: &[u8]) -> Option<HardwareAddress> {
    strip_prefix(datagram, SHUTDOWN_PREFIX).and_then(HardwareAddress::parse_hex)
}

fn strip_prefix<'a>(datagram: &'a [u8], prefix: &str) -> Option<&'a str> {
    let text = core::str::from_utf8(datagram).ok()?;
    let rest = text.strip_prefix(prefix)?;
    Some(rest.trim_end_matches(|c: char| c.is_ascii_whitespace() || c == '\0'))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const TARGET: HardwareAddress = HardwareAddress::new([0x22, 0x33, 0x4D, 0x06, 0x43, 0xED]);

    #[test]
    fn wake_packet_layout() {
        for address in [
            TARGET,
            HardwareAddress::new([0; 6]),
            HardwareAddress::new([0xFF; 6]),
            HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
        ] {
            let packet = build_wake_packet(&address);
            assert_eq!(packet.len(), 102);
            assert_eq!(&packet[..6], &[0xFF; 6]);
            for k in 0..16 {
                assert_eq!(&packet[6 + 6 * k..12 + 6 * k], address.as_bytes());
            }
        }
    }

    #[test]
    fn shutdown_payload_format() {
        assert_eq!(build_shutdown_payload(&TARGET), "SHUTDOWN_ESP|22334D0643ED");
        assert_eq!(
            build_shutdown_payload(&HardwareAddress::new([0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f])),
            "SHUTDOWN_ESP|0A0B0C0D0E0F"
        );
    }

    #[test]
    fn heartbeat_source_is_extracted() {
        assert_eq!(parse_heartbeat(b"HEARTBEAT|22334d0643ed"), Some("22334d0643ed"));
        assert_eq!(parse_heartbeat(b"HEARTBEAT|22334D0643ED\r\n\0"), Some("22334D0643ED"));
        assert_eq!(parse_heartbeat(b"heartbeat|22334D0643ED"), None);
        assert_eq!(parse_heartbeat(b"SHUTDOWN_ESP|22334D0643ED"), None);
        assert_eq!(parse_heartbeat(&[0xFF, 0xFE]), None);
    }

    #[test]
    fn heartbeat_payload_round_trips_through_parser() {
        let payload = build_heartbeat_payload(&TARGET);
        assert_eq!(payload, "HEARTBEAT|22334D0643ED");
        assert_eq!(parse_heartbeat(payload.as_bytes()), Some("22334D0643ED"));
    }

    #[test]
    fn shutdown_datagram_is_parsed() {
        assert_eq!(parse_shutdown(b"SHUTDOWN_ESP|22334D0643ED"), Some(TARGET));
        assert_eq!(parse_shutdown(b"SHUTDOWN_ESP|22334D0643"), None);
        assert_eq!(parse_shutdown(b"HEARTBEAT|22334D0643ED"), None);
    }
}
