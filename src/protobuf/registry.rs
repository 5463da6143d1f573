//! Loads the four `.proto` files the upstream wire protocol is defined in
//! and resolves the wrapper message and payload-type enum by name suffix.

use prost_reflect::{DescriptorPool, EnumDescriptor, MessageDescriptor};
use std::path::Path;

use crate::error::GatewayError;

const PROTO_FILES: &[&str] = &[
    "OpenApiCommonModelMessages.proto",
    "OpenApiCommonMessages.proto",
    "OpenApiModelMessages.proto",
    "OpenApiMessages.proto",
];

const WRAPPER_SUFFIX: &str = "ProtoMessage";
const PAYLOAD_ENUM_SUFFIX: &str = "ProtoOAPayloadType";

const MAX_SUGGESTIONS: usize = 10;

/// Upstream has renamed a handful of messages/enum values over time; a miss
/// on the canonical name is retried against this table before failing.
/// Documented as an accepted tradeoff in DESIGN.md rather than assuming the
/// venue never renames anything.
const ENUM_KEY_ALIASES: &[(&str, &str)] = &[(
    "PROTO_OA_GET_ACCOUNTS_BY_ACCESS_TOKEN_REQ",
    "PROTO_OA_GET_ACCOUNT_LIST_BY_ACCESS_TOKEN_REQ",
)];

/// Same rename, on the message-type side: a name derived from a renamed enum
/// key (e.g. via `message_type_from_payload_name`) is retried against this
/// table before failing, mirroring `ENUM_KEY_ALIASES` above.
const MESSAGE_TYPE_ALIASES: &[(&str, &str)] = &[(
    "ProtoOAGetAccountsByAccessTokenReq",
    "ProtoOAGetAccountListByAccessTokenReq",
)];

pub struct ProtoRegistry {
    pool: DescriptorPool,
    wrapper: MessageDescriptor,
    payload_enum: EnumDescriptor,
}

impl ProtoRegistry {
    /// Compile the `.proto` files found in `proto_dir` and resolve the
    /// wrapper message and payload-type enum.
    pub fn load(proto_dir: &Path) -> Result<Self, GatewayError> {
        let files: Vec<_> = PROTO_FILES.iter().map(|f| proto_dir.join(f)).collect();
        for f in &files {
            if !f.is_file() {
                return Err(GatewayError::Schema(format!(
                    "missing proto file: {}",
                    f.display()
                )));
            }
        }

        let file_descriptor_set = protox::compile(&files, [proto_dir])
            .map_err(|e| GatewayError::Schema(format!("failed to compile proto files: {e}")))?;
        let pool = DescriptorPool::from_file_descriptor_set(file_descriptor_set)
            .map_err(|e| GatewayError::Schema(format!("failed to build descriptor pool: {e}")))?;

        let wrapper = pool
            .all_messages()
            .find(|m| m.name().ends_with(WRAPPER_SUFFIX))
            .ok_or_else(|| {
                GatewayError::Schema(format!("no message ending in {WRAPPER_SUFFIX} found"))
            })?;
        let payload_enum = pool
            .all_enums()
            .find(|e| e.name().ends_with(PAYLOAD_ENUM_SUFFIX))
            .ok_or_else(|| {
                GatewayError::Schema(format!("no enum ending in {PAYLOAD_ENUM_SUFFIX} found"))
            })?;

        Ok(Self {
            pool,
            wrapper,
            payload_enum,
        })
    }

    pub fn wrapper_message(&self) -> &MessageDescriptor {
        &self.wrapper
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Resolve a message type by its short name (e.g. `ProtoOAAccountAuthReq`),
    /// trying `MESSAGE_TYPE_ALIASES` on a direct miss.
    pub fn message_descriptor(&self, type_name: &str) -> Result<MessageDescriptor, GatewayError> {
        if let Some(desc) = self.pool.all_messages().find(|m| m.name() == type_name) {
            return Ok(desc);
        }
        if let Some((_, canonical)) = MESSAGE_TYPE_ALIASES.iter().find(|(old, _)| *old == type_name) {
            if let Some(desc) = self.pool.all_messages().find(|m| m.name() == *canonical) {
                return Ok(desc);
            }
        }
        Err(GatewayError::Schema(format!("unknown message type '{type_name}'")))
    }

    pub fn has_field(&self, type_name: &str, field_name: &str) -> bool {
        match self.message_descriptor(type_name) {
            Ok(desc) => desc.get_field_by_name(field_name).is_some(),
            Err(_) => false,
        }
    }

    /// Numeric id for an enum key like `PROTO_OA_ACCOUNT_AUTH_REQ`, trying
    /// the alias table on a direct miss.
    pub fn payload_type_id(&self, enum_key: &str) -> Result<i32, GatewayError> {
        if let Some(v) = self.payload_enum.get_value_by_name(enum_key) {
            return Ok(v.number());
        }
        if let Some((_, canonical)) = ENUM_KEY_ALIASES.iter().find(|(old, _)| *old == enum_key) {
            if let Some(v) = self.payload_enum.get_value_by_name(canonical) {
                return Ok(v.number());
            }
        }
        Err(self.unknown_enum_key_error(enum_key))
    }

    pub fn payload_type_name(&self, id: i32) -> Result<String, GatewayError> {
        self.payload_enum
            .get_value(id)
            .map(|v| v.name().to_string())
            .ok_or_else(|| GatewayError::Schema(format!("unknown payload type id {id}")))
    }

    /// `PROTO_OA_ACCOUNT_AUTH_REQ` -> `ProtoOAAccountAuthReq`, preserving the
    /// `OA` token as two uppercase letters rather than titlecasing it to `Oa`.
    pub fn message_type_from_payload_name(enum_key: &str) -> String {
        enum_key
            .split('_')
            .filter(|s| !s.is_empty())
            .map(|segment| {
                if segment.eq_ignore_ascii_case("oa") {
                    "OA".to_string()
                } else {
                    let mut chars = segment.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                        }
                        None => String::new(),
                    }
                }
            })
            .collect()
    }

    fn unknown_enum_key_error(&self, enum_key: &str) -> GatewayError {
        let needle = enum_key.to_ascii_lowercase();
        let suggestions: Vec<&str> = self
            .payload_enum
            .values()
            .map(|v| v.name())
            .filter(|name| name.to_ascii_lowercase().contains(&needle) || needle.contains(&name.to_ascii_lowercase()))
            .take(MAX_SUGGESTIONS)
            .collect();

        if suggestions.is_empty() {
            GatewayError::Schema(format!("unknown payload type '{enum_key}'"))
        } else {
            GatewayError::Schema(format!(
                "unknown payload type '{enum_key}' — did you mean one of: {}",
                suggestions.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn proto_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("proto")
    }

    #[test]
    fn message_type_from_payload_name_preserves_oa_token() {
        assert_eq!(
            ProtoRegistry::message_type_from_payload_name("PROTO_OA_ACCOUNT_AUTH_REQ"),
            "ProtoOAAccountAuthReq"
        );
        assert_eq!(
            ProtoRegistry::message_type_from_payload_name("PROTO_OA_GET_ACCOUNT_LIST_BY_ACCESS_TOKEN_REQ"),
            "ProtoOAGetAccountListByAccessTokenReq"
        );
        assert_eq!(
            ProtoRegistry::message_type_from_payload_name("PROTO_HEARTBEAT_EVENT"),
            "ProtoHeartbeatEvent"
        );
    }

    #[test]
    fn loads_real_proto_directory_and_resolves_payload_type_ids() {
        let registry = ProtoRegistry::load(&proto_dir()).expect("proto dir should compile");
        assert_eq!(
            registry.payload_type_id("PROTO_OA_ACCOUNT_AUTH_REQ").unwrap(),
            2102
        );
        assert_eq!(
            registry.payload_type_name(2102).unwrap(),
            "PROTO_OA_ACCOUNT_AUTH_REQ"
        );
    }

    #[test]
    fn unknown_payload_type_suggests_near_matches() {
        let registry = ProtoRegistry::load(&proto_dir()).expect("proto dir should compile");
        let err = registry.payload_type_id("PROTO_OA_ACCOUNT_AUTH_RQ").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("did you mean"));
        assert!(msg.contains("PROTO_OA_ACCOUNT_AUTH_REQ"));
    }

    #[test]
    fn alias_table_resolves_renamed_enum_key() {
        let registry = ProtoRegistry::load(&proto_dir()).expect("proto dir should compile");
        assert_eq!(
            registry
                .payload_type_id("PROTO_OA_GET_ACCOUNTS_BY_ACCESS_TOKEN_REQ")
                .unwrap(),
            registry
                .payload_type_id("PROTO_OA_GET_ACCOUNT_LIST_BY_ACCESS_TOKEN_REQ")
                .unwrap()
        );
    }

    #[test]
    fn alias_table_resolves_renamed_message_type() {
        let registry = ProtoRegistry::load(&proto_dir()).expect("proto dir should compile");
        // The renamed enum key's derived type name (ProtoOAGetAccountsByAccessTokenReq)
        // doesn't exist in the schema; message_descriptor must fall back to the
        // canonical type the way payload_type_id already does for the enum key.
        let aliased = registry
            .message_descriptor("ProtoOAGetAccountsByAccessTokenReq")
            .expect("message-type alias should resolve");
        let canonical = registry
            .message_descriptor("ProtoOAGetAccountListByAccessTokenReq")
            .expect("canonical type should resolve");
        assert_eq!(aliased.full_name(), canonical.full_name());
    }

    #[test]
    fn has_field_checks_declared_fields_verbatim() {
        let registry = ProtoRegistry::load(&proto_dir()).expect("proto dir should compile");
        assert!(registry.has_field("ProtoOAAccountAuthReq", "ctidTraderAccountId"));
        assert!(!registry.has_field("ProtoOAAccountAuthReq", "accountId"));
    }
}
