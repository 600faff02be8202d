use serde::Serialize;
use serde_json::Value;

use crate::{
    address::HardwareAddress,
    error::{Error, Result},
    identity::{DeviceIdentity, SetupCode, CATEGORY_SWITCH, SETUP_ID},
    store::TargetStore,
};

pub const TARGET_MAC_FIELD: &str = "target_mac";
// Every failure reply uses this status; the code tells causes apart.
pub const FAILURE_STATUS: &str = "nvs_error";
pub const MAX_RESPONSE_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProvisioningSuccess {
    #[serde(rename = "categoryId")]
    pub category_id: u8,
    pub password: SetupCode,
    #[serde(rename = "setupId")]
    pub setup_id: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProvisioningFailure {
    pub status: &'static str,
    pub err: i32,
}

// JSON objects are read strictly. Anything else is scanned loosely for
// `target_mac` followed by `:` or `=` and an address token.
pub fn parse_target_mac(payload: &[u8]) -> Result<HardwareAddress> {
    let text = core::str::from_utf8(payload)
        .map_err(|_| Error::invalid_argument("provisioning payload is not utf-8"))?;

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => match fields.get(TARGET_MAC_FIELD) {
            Some(Value::String(value)) => value.parse(),
            Some(_) => Err(Error::invalid_argument("target_mac must be a string")),
            None => Err(Error::invalid_argument("target_mac missing")),
        },
        Ok(_) => Err(Error::invalid_argument("provisioning payload is not an object")),
        Err(_) => scan_target_mac(text),
    }
}

fn scan_target_mac(text: &str) -> Result<HardwareAddress> {
    let start = text
        .find(TARGET_MAC_FIELD)
        .ok_or_else(|| Error::invalid_argument("target_mac missing"))?;
    let rest = &text[start + TARGET_MAC_FIELD.len()..];

    let value_start = rest
        .find([':', '='])
        .ok_or_else(|| Error::invalid_argument("target_mac has no value"))?;
    let value = rest[value_start + 1..].trim_start_matches([' ', '\t', '"', '\'']);

    let token_len = value
        .find(|c: char| !(c.is_ascii_hexdigit() || c == ':' || c == '-'))
        .unwrap_or(value.len());
    value[..token_len].parse()
}

pub struct ProvisioningEndpoint<S> {
    store: S,
    identity: DeviceIdentity,
}

impl<S: TargetStore> ProvisioningEndpoint<S> {
    pub fn new(store: S, identity: DeviceIdentity) -> Self {
        Self { store, identity }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn apply(&self, payload: Option<&[u8]>) -> Result<Option<HardwareAddress>> {
        let Some(payload) = payload.filter(|payload| !payload.is_empty()) else {
            return Ok(None);
        };

        let address = parse_target_mac(payload)?;
        self.store.set(address)?;
        Ok(Some(address))
    }

    pub fn success(&self) -> ProvisioningSuccess {
        ProvisioningSuccess {
            category_id: CATEGORY_SWITCH,
            password: self.identity.setup_code,
            setup_id: SETUP_ID,
        }
    }

    pub fn handle(&self, payload: Option<&[u8]>) -> Vec<u8> {
        self.response(&self.apply(payload))
    }

    pub fn response(&self, outcome: &Result<Option<HardwareAddress>>) -> Vec<u8> {
        let body = match outcome {
            Ok(_) => serde_json::to_vec(&self.success()),
            Err(err) => serde_json::to_vec(&ProvisioningFailure {
                status: FAILURE_STATUS,
                err: err.code(),
            }),
        };
        // Both bodies are plain structs of strings and integers.
        body.unwrap_or_else(|_| br#"{"status":"nvs_error","err":-1}"#.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::{MemoryTargetStore, StoreFault, TargetRecord};

    const TARGET: HardwareAddress = HardwareAddress::new([0x22, 0x33, 0x4D, 0x06, 0x43, 0xED]);
    const DEVICE: HardwareAddress = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    fn endpoint(store: MemoryTargetStore) -> ProvisioningEndpoint<MemoryTargetStore> {
        ProvisioningEndpoint::new(store, DeviceIdentity::new(DEVICE))
    }

    fn response(endpoint: &ProvisioningEndpoint<MemoryTargetStore>, payload: &[u8]) -> String {
        String::from_utf8(endpoint.handle(Some(payload))).unwrap()
    }

    #[test]
    fn json_payload_is_stored_and_acknowledged() {
        let endpoint = endpoint(MemoryTargetStore::new());
        let body = response(&endpoint, br#"{"target_mac":"22:33:4D:06:43:ED"}"#);

        assert_eq!(
            body,
            r#"{"categoryId":8,"password":"29452928","setupId":"7G9X"}"#
        );
        assert_eq!(endpoint.store.get().unwrap(), TargetRecord::configured(TARGET));
        assert!(body.len() <= MAX_RESPONSE_LEN);
    }

    #[test]
    fn malformed_address_is_rejected_without_mutation() {
        let endpoint = endpoint(MemoryTargetStore::with_target(TARGET));
        let body = response(&endpoint, br#"{"target_mac":"not-a-mac"}"#);

        assert_eq!(body, r#"{"status":"nvs_error","err":258}"#);
        assert_eq!(endpoint.store.get().unwrap().address, TARGET);
        assert_eq!(endpoint.store.writes(), 0);
    }

    #[test]
    fn empty_payload_keeps_existing_record() {
        let endpoint = endpoint(MemoryTargetStore::with_target(TARGET));

        for payload in [None, Some(&b""[..])] {
            let body = String::from_utf8(endpoint.handle(payload)).unwrap();
            assert!(body.contains(r#""password":"29452928""#));
        }
        assert_eq!(endpoint.store.get().unwrap(), TargetRecord::configured(TARGET));
        assert_eq!(endpoint.store.writes(), 0);
    }

    #[test]
    fn store_failure_code_is_surfaced() {
        let store = MemoryTargetStore::new();
        store.inject_fault(StoreFault::CommitFails(0x1105));
        let endpoint = endpoint(store);

        let body = response(&endpoint, br#"{"target_mac":"22-33-4d-06-43-ed"}"#);
        assert_eq!(body, r#"{"status":"nvs_error","err":4357}"#);
    }

    #[test]
    fn unavailable_store_is_reported() {
        let store = MemoryTargetStore::new();
        store.inject_fault(StoreFault::Unavailable);
        let endpoint = endpoint(store);

        let body = response(&endpoint, br#"{"target_mac":"22:33:4D:06:43:ED"}"#);
        assert_eq!(body, r#"{"status":"nvs_error","err":4353}"#);
    }

    #[test]
    fn loose_payloads_are_scanned() {
        for payload in [
            &br#"{ "target_mac" : "22-33-4D-06-43-ED", }"#[..],
            b"target_mac=22:33:4d:06:43:ed",
            b"target_mac: 22:33:4D:06:43:ED\n",
            b"{'target_mac': '22:33:4D:06:43:ED'}",
        ] {
            assert_eq!(parse_target_mac(payload).unwrap(), TARGET);
        }
    }

    #[test]
    fn missing_or_mistyped_field_is_invalid() {
        for payload in [
            &br#"{"mac":"22:33:4D:06:43:ED"}"#[..],
            br#"{"target_mac":42}"#,
            br#"["22:33:4D:06:43:ED"]"#,
            b"target_mac",
            &[0xC3_u8, 0x28][..],
        ] {
            assert!(matches!(
                parse_target_mac(payload),
                Err(Error::InvalidArgument(_))
            ));
        }
    }
}
