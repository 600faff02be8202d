use std::fmt;

use serde::Serialize;

use crate::address::HardwareAddress;

pub const CATEGORY_SWITCH: u8 = 8;
pub const SETUP_ID: &str = "7G9X";

const SETUP_CODE_SEED: u32 = 5381;
const SETUP_CODE_RANGE: u32 = 90_000_000;
const SETUP_CODE_BASE: u32 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SetupCode(u32);

impl SetupCode {
    // djb2 over the six identity bytes in 32-bit wrapping arithmetic,
    // folded into `10_000_000..100_000_000`.
    pub fn derive(device_id: &HardwareAddress) -> Self {
        let hash = device_id
            .as_bytes()
            .iter()
            .fold(SETUP_CODE_SEED, |hash, &byte| {
                hash.wrapping_mul(33).wrapping_add(u32::from(byte))
            });
        Self(hash % SETUP_CODE_RANGE + SETUP_CODE_BASE)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn formatted(self) -> String {
        let digits = self.to_string();
        format!("{}-{}-{}", &digits[..3], &digits[3..5], &digits[5..])
    }
}

impl fmt::Display for SetupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

impl Serialize for SetupCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub mac: HardwareAddress,
    pub setup_code: SetupCode,
}

impl DeviceIdentity {
    pub fn new(mac: HardwareAddress) -> Self {
        Self {
            mac,
            setup_code: SetupCode::derive(&mac),
        }
    }

    pub fn serial_number(&self) -> String {
        self.mac.to_hex()
    }

    pub fn service_name(&self) -> String {
        let [.., d, e, f] = self.mac.octets();
        format!("PROV_{d:02X}{e:02X}{f:02X}")
    }

    pub fn proof_of_possession(&self) -> String {
        self.mac.as_bytes()[2..]
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_code_is_deterministic() {
        let id = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let code = SetupCode::derive(&id);
        assert_eq!(code.to_string(), "29452928");
        assert_eq!(SetupCode::derive(&id), code);
        assert_eq!(code.formatted(), "294-52-928");
    }

    #[test]
    fn setup_code_always_has_eight_digits() {
        for id in [[0_u8; 6], [0xFF; 6], [0x24, 0x6F, 0x28, 0x01, 0x02, 0x03]] {
            let code = SetupCode::derive(&HardwareAddress::new(id));
            assert!((10_000_000..100_000_000).contains(&code.value()));
            assert_eq!(code.to_string().len(), 8);
        }
        assert_eq!(
            SetupCode::derive(&HardwareAddress::new([0; 6])).to_string(),
            "52056261"
        );
    }

    #[test]
    fn provisioning_names_come_from_mac() {
        let mac = HardwareAddress::new([0x24, 0x6F, 0x28, 0xA1, 0xB2, 0xC3]);
        let identity = DeviceIdentity::new(mac);
        assert_eq!(identity.service_name(), "PROV_A1B2C3");
        assert_eq!(identity.proof_of_possession(), "28a1b2c3");
        assert_eq!(identity.serial_number(), "246F28A1B2C3");
    }
}
