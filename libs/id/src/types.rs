//! Identifier definitions.

use sha2::{Digest, Sha256};

use crate::{define_id, define_key};

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(EventId, "evt");
define_id!(IntegrationId, "int");

impl EventId {
    /// Derives a stable event ID from the parts that identify an occurrence.
    ///
    /// The same parts always produce the same ID, so an occurrence that is
    /// recorded twice (for example after a retried sync) collides on append
    /// instead of producing a duplicate event. Parts are length-prefixed
    /// before hashing so `["ab", "c"]` and `["a", "bc"]` differ.
    #[must_use]
    pub fn derived<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            let part = part.as_ref();
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(crate::Ulid::from_bytes(bytes))
    }
}

// =============================================================================
// External keys
// =============================================================================

define_key!(TenantId, "tenant ID");
define_key!(DeviceId, "device ID");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_event_id_roundtrip() {
        let id = EventId::new();
        let s = id.to_string();
        let parsed: EventId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("evt_"));
    }

    #[test]
    fn test_event_id_invalid_prefix() {
        let result: Result<EventId, _> = "int_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::InvalidPrefix { .. })));
    }

    #[test]
    fn test_event_id_missing_separator() {
        let result: Result<EventId, _> = "evt01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::MissingSeparator)));
    }

    #[test]
    fn test_event_id_invalid_ulid() {
        let result: Result<EventId, _> = "evt_invalid".parse();
        assert!(matches!(result, Err(IdError::InvalidUlid(_))));
    }

    #[test]
    fn test_event_id_json_roundtrip() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_event_ids_sortable() {
        let id1 = EventId::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let id2 = EventId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_derived_event_id_is_stable() {
        let a = EventId::derived(["t1", "dev-1", "provisioned", "occ-1"]);
        let b = EventId::derived(["t1", "dev-1", "provisioned", "occ-1"]);
        let c = EventId::derived(["t1", "dev-1", "provisioned", "occ-2"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_derived_event_id_is_length_prefixed() {
        assert_ne!(EventId::derived(["ab", "c"]), EventId::derived(["a", "bc"]));
    }

    #[test]
    fn test_tenant_id_validation() {
        assert!(TenantId::parse("123456789012345678901234").is_ok());
        assert_eq!(TenantId::parse(""), Err(IdError::Empty));
        assert!(matches!(
            TenantId::parse("with space"),
            Err(IdError::InvalidCharacter { ch: ' ', .. })
        ));
        assert!(matches!(
            TenantId::parse("x".repeat(TenantId::MAX_LEN + 1)),
            Err(IdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_tenant_id_deserialize_rejects_empty() {
        let result: Result<TenantId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_device_id_as_str() {
        let device = DeviceId::parse("44a66a7e-4b09-4665-b343-0c5d3ad9a2ed").unwrap();
        assert_eq!(device.as_str(), "44a66a7e-4b09-4665-b343-0c5d3ad9a2ed");
        assert_eq!(device.to_string(), device.as_str());
    }

    #[test]
    fn test_id_prefixes_unique() {
        assert_ne!(EventId::PREFIX, IntegrationId::PREFIX);
    }

    proptest! {
        #[test]
        fn prop_printable_keys_roundtrip(s in "[A-Za-z0-9_.:-]{1,64}") {
            let key = DeviceId::parse(s.clone()).unwrap();
            let json = serde_json::to_string(&key).unwrap();
            let parsed: DeviceId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(parsed.as_str(), s.as_str());
        }

        #[test]
        fn prop_generated_ids_parse(_seed in 0u8..8) {
            let id = IntegrationId::new();
            prop_assert_eq!(IntegrationId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
