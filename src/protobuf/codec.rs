//! Dynamic message encode/decode and string-enum coercion.
//!
//! Callers build request payloads as `serde_json::Value` objects with
//! human-readable enum values (`"BUY"`, `"MARKET"`) since that is what a
//! JSON HTTP body naturally carries; this module is where those strings are
//! coerced to the numeric values protobuf actually puts on the wire.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use prost::Message as _;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, Value as PValue};
use serde_json::{Map, Value};

use crate::error::GatewayError;
use super::registry::ProtoRegistry;

/// A decoded inbound frame, prior to payload-name resolution.
#[derive(Debug, Clone)]
pub struct DecodedEnvelope {
    pub payload_type: u32,
    pub payload: Vec<u8>,
    pub client_msg_id: Option<String>,
}

impl ProtoRegistry {
    pub fn encode_message(&self, type_name: &str, obj: &Value) -> Result<Vec<u8>, GatewayError> {
        let desc = self.message_descriptor(type_name)?;
        let obj = obj
            .as_object()
            .ok_or_else(|| GatewayError::Schema(format!("{type_name} payload must be a JSON object")))?;
        let msg = build_dynamic_message(&desc, obj)?;
        Ok(msg.encode_to_vec())
    }

    pub fn decode_message(&self, type_name: &str, bytes: &[u8]) -> Result<Value, GatewayError> {
        let desc = self.message_descriptor(type_name)?;
        let msg = DynamicMessage::decode(desc, bytes)
            .map_err(|e| GatewayError::Decode(format!("failed to decode {type_name}: {e}")))?;
        Ok(message_to_json(&msg))
    }

    /// Wrap an already-encoded payload in the transport envelope.
    pub fn encode_proto_message(
        &self,
        payload_type_id: i32,
        payload_bytes: Vec<u8>,
        client_msg_id: Option<String>,
    ) -> Result<Vec<u8>, GatewayError> {
        let wrapper_desc = self.wrapper_message().clone();
        let mut msg = DynamicMessage::new(wrapper_desc);

        set_scalar_field(&mut msg, "payloadType", PValue::U32(payload_type_id as u32))?;
        set_scalar_field(&mut msg, "payload", PValue::Bytes(payload_bytes.into()))?;
        if let Some(id) = client_msg_id {
            set_scalar_field(&mut msg, "clientMsgId", PValue::String(id))?;
        }

        Ok(msg.encode_to_vec())
    }

    pub fn decode_proto_message(&self, bytes: &[u8]) -> Result<DecodedEnvelope, GatewayError> {
        let msg = DynamicMessage::decode(self.wrapper_message().clone(), bytes)
            .map_err(|e| GatewayError::Decode(format!("failed to decode envelope: {e}")))?;

        let payload_type = get_field_value(&msg, "payloadType")
            .and_then(|v| match v {
                PValue::U32(n) => Some(n),
                PValue::I32(n) => Some(n as u32),
                _ => None,
            })
            .ok_or_else(|| GatewayError::Decode("envelope missing payloadType".to_string()))?;

        let payload = get_field_value(&msg, "payload")
            .and_then(|v| match v {
                PValue::Bytes(b) => Some(b.to_vec()),
                _ => None,
            })
            .unwrap_or_default();

        let client_msg_id = get_field_value(&msg, "clientMsgId").and_then(|v| match v {
            PValue::String(s) => Some(s),
            _ => None,
        });

        Ok(DecodedEnvelope {
            payload_type,
            payload,
            client_msg_id,
        })
    }
}

fn get_field_value(msg: &DynamicMessage, field_name: &str) -> Option<PValue> {
    let field = msg.descriptor().get_field_by_name(field_name)?;
    if !msg.has_field(&field) {
        return None;
    }
    Some(msg.get_field(&field).into_owned())
}

fn set_scalar_field(msg: &mut DynamicMessage, field_name: &str, value: PValue) -> Result<(), GatewayError> {
    let field = msg
        .descriptor()
        .get_field_by_name(field_name)
        .ok_or_else(|| GatewayError::Schema(format!("envelope has no field '{field_name}'")))?;
    msg.set_field(&field, value);
    Ok(())
}

fn build_dynamic_message(
    desc: &MessageDescriptor,
    obj: &Map<String, Value>,
) -> Result<DynamicMessage, GatewayError> {
    let mut msg = DynamicMessage::new(desc.clone());
    for (key, value) in obj {
        if value.is_null() {
            continue;
        }
        let Some(field) = desc.get_field_by_name(key) else {
            return Err(GatewayError::Schema(format!(
                "{} has no field '{key}'",
                desc.name()
            )));
        };
        let reflect_value = convert_json_to_value(&field, value)?;
        msg.set_field(&field, reflect_value);
    }
    Ok(msg)
}

fn convert_json_to_value(field: &FieldDescriptor, value: &Value) -> Result<PValue, GatewayError> {
    if field.is_list() {
        let items = value
            .as_array()
            .ok_or_else(|| GatewayError::Schema(format!("field '{}' expects an array", field.name())))?;
        let converted = items
            .iter()
            .map(|item| convert_scalar(field, item))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(PValue::List(converted));
    }
    convert_scalar(field, value)
}

/// Coerce one JSON value to the wire representation of `field`. String enum
/// constants (`"BUY"`, `"MARKET"`) are resolved to their declared numeric
/// value here — this is the one coercion point every enum-typed field goes
/// through, scalar or repeated.
fn convert_scalar(field: &FieldDescriptor, value: &Value) -> Result<PValue, GatewayError> {
    match field.kind() {
        Kind::Enum(enum_desc) => match value {
            Value::String(s) => enum_desc
                .get_value_by_name(s)
                .map(|v| PValue::EnumNumber(v.number()))
                .ok_or_else(|| {
                    GatewayError::Schema(format!(
                        "'{s}' is not a valid value of enum {}",
                        enum_desc.name()
                    ))
                }),
            Value::Number(n) => n
                .as_i64()
                .map(|i| PValue::EnumNumber(i as i32))
                .ok_or_else(|| GatewayError::Schema(format!("invalid enum number for field '{}'", field.name()))),
            other => Err(GatewayError::Schema(format!(
                "field '{}' expects a string or number enum value, got {other}",
                field.name()
            ))),
        },
        Kind::Message(nested) | Kind::Group(nested) => {
            let obj = value
                .as_object()
                .ok_or_else(|| GatewayError::Schema(format!("field '{}' expects an object", field.name())))?;
            Ok(PValue::Message(build_dynamic_message(&nested, obj)?))
        }
        Kind::Bool => value
            .as_bool()
            .map(PValue::Bool)
            .ok_or_else(|| type_mismatch(field, "bool")),
        Kind::String => value
            .as_str()
            .map(|s| PValue::String(s.to_string()))
            .ok_or_else(|| type_mismatch(field, "string")),
        Kind::Bytes => value
            .as_str()
            .and_then(|s| STANDARD.decode(s).ok())
            .map(|b| PValue::Bytes(b.into()))
            .ok_or_else(|| type_mismatch(field, "base64 string")),
        Kind::Double => value
            .as_f64()
            .map(PValue::F64)
            .ok_or_else(|| type_mismatch(field, "double")),
        Kind::Float => value
            .as_f64()
            .map(|f| PValue::F32(f as f32))
            .ok_or_else(|| type_mismatch(field, "float")),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => value
            .as_i64()
            .map(|i| PValue::I32(i as i32))
            .ok_or_else(|| type_mismatch(field, "int32")),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => value
            .as_i64()
            .map(PValue::I64)
            .ok_or_else(|| type_mismatch(field, "int64")),
        Kind::Uint32 | Kind::Fixed32 => value
            .as_u64()
            .map(|i| PValue::U32(i as u32))
            .ok_or_else(|| type_mismatch(field, "uint32")),
        Kind::Uint64 | Kind::Fixed64 => value
            .as_u64()
            .map(PValue::U64)
            .ok_or_else(|| type_mismatch(field, "uint64")),
    }
}

fn type_mismatch(field: &FieldDescriptor, expected: &str) -> GatewayError {
    GatewayError::Schema(format!("field '{}' expects a {expected}", field.name()))
}

fn message_to_json(msg: &DynamicMessage) -> Value {
    let mut map = Map::new();
    for field in msg.descriptor().fields() {
        if !msg.has_field(&field) {
            continue;
        }
        let value = msg.get_field(&field);
        map.insert(field.name().to_string(), reflect_value_to_json(&field, &value));
    }
    Value::Object(map)
}

fn reflect_value_to_json(field: &FieldDescriptor, value: &PValue) -> Value {
    match value {
        PValue::Bool(b) => Value::Bool(*b),
        PValue::I32(i) => Value::from(*i),
        PValue::I64(i) => Value::from(*i),
        PValue::U32(i) => Value::from(*i),
        PValue::U64(i) => Value::from(*i),
        PValue::F32(f) => Value::from(*f as f64),
        PValue::F64(f) => Value::from(*f),
        PValue::String(s) => Value::String(s.clone()),
        PValue::Bytes(b) => Value::String(STANDARD.encode(b)),
        PValue::EnumNumber(n) => match field.kind() {
            Kind::Enum(enum_desc) => enum_desc
                .get_value(*n)
                .map(|v| Value::String(v.name().to_string()))
                .unwrap_or_else(|| Value::from(*n)),
            _ => Value::from(*n),
        },
        PValue::Message(nested) => message_to_json(nested),
        PValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| reflect_value_to_json(field, item))
                .collect(),
        ),
        PValue::Map(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn registry() -> ProtoRegistry {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("proto");
        ProtoRegistry::load(&dir).expect("proto dir should compile")
    }

    #[test]
    fn encode_decode_roundtrips_scalar_and_string_fields() {
        let reg = registry();
        let obj = json!({"ctidTraderAccountId": 12345, "accessToken": "tok-abc"});
        let bytes = reg.encode_message("ProtoOAAccountAuthReq", &obj).unwrap();
        let decoded = reg.decode_message("ProtoOAAccountAuthReq", &bytes).unwrap();
        assert_eq!(decoded["ctidTraderAccountId"], json!(12345));
        assert_eq!(decoded["accessToken"], json!("tok-abc"));
    }

    #[test]
    fn encode_coerces_string_enum_to_numeric_and_decode_restores_the_name() {
        let reg = registry();
        let obj = json!({
            "ctidTraderAccountId": 1,
            "symbolId": 1,
            "orderType": "MARKET",
            "tradeSide": "BUY",
            "volume": 10000,
        });
        let bytes = reg.encode_message("ProtoOANewOrderReq", &obj).unwrap();
        let decoded = reg.decode_message("ProtoOANewOrderReq", &bytes).unwrap();
        assert_eq!(decoded["orderType"], json!("MARKET"));
        assert_eq!(decoded["tradeSide"], json!("BUY"));
    }

    #[test]
    fn encode_coerces_repeated_enum_and_scalar_fields() {
        let reg = registry();
        let obj = json!({"ctidTraderAccountId": 1, "symbolId": [1, 2, 3]});
        let bytes = reg.encode_message("ProtoOASubscribeSpotsReq", &obj).unwrap();
        let decoded = reg.decode_message("ProtoOASubscribeSpotsReq", &bytes).unwrap();
        assert_eq!(decoded["symbolId"], json!([1, 2, 3]));
    }

    #[test]
    fn unknown_enum_value_is_rejected() {
        let reg = registry();
        let obj = json!({
            "ctidTraderAccountId": 1,
            "symbolId": 1,
            "orderType": "HOLD",
            "tradeSide": "BUY",
            "volume": 1,
        });
        assert!(reg.encode_message("ProtoOANewOrderReq", &obj).is_err());
    }

    #[test]
    fn unknown_field_name_is_rejected() {
        let reg = registry();
        let obj = json!({"ctidTraderAccountId": 1, "notAField": true});
        assert!(reg.encode_message("ProtoOAAccountAuthReq", &obj).is_err());
    }

    #[test]
    fn envelope_roundtrips_payload_and_client_msg_id() {
        let reg = registry();
        let payload = reg
            .encode_message("ProtoOAAccountAuthReq", &json!({"ctidTraderAccountId": 7, "accessToken": "t"}))
            .unwrap();
        let id = reg.payload_type_id("PROTO_OA_ACCOUNT_AUTH_REQ").unwrap();
        let framed = reg
            .encode_proto_message(id, payload.clone(), Some("42".to_string()))
            .unwrap();

        let envelope = reg.decode_proto_message(&framed).unwrap();
        assert_eq!(envelope.payload_type, id as u32);
        assert_eq!(envelope.payload, payload);
        assert_eq!(envelope.client_msg_id, Some("42".to_string()));
    }
}
