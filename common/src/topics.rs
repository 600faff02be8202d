pub const TOPIC_SWITCH_STATE: &str = "launcher/switch/state";
pub const TOPIC_SWITCH_SET: &str = "launcher/switch/set";
pub const TOPIC_STATUS: &str = "launcher/status";

pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

pub fn switch_payload(on: bool) -> &'static str {
    if on {
        PAYLOAD_ON
    } else {
        PAYLOAD_OFF
    }
}

pub fn parse_switch_payload(payload: &[u8]) -> Option<bool> {
    let text = core::str::from_utf8(payload).ok()?.trim();
    if ["on", "1", "true"].iter().any(|v| text.eq_ignore_ascii_case(v)) {
        Some(true)
    } else if ["off", "0", "false"].iter().any(|v| text.eq_ignore_ascii_case(v)) {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_payloads() {
        assert_eq!(parse_switch_payload(b"ON"), Some(true));
        assert_eq!(parse_switch_payload(b" off\n"), Some(false));
        assert_eq!(parse_switch_payload(b"1"), Some(true));
        assert_eq!(parse_switch_payload(b"toggle"), None);
        assert_eq!(switch_payload(false), "OFF");
    }
}
