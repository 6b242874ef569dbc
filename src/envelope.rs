//! TLV framing and key-exchange envelope codec.
//!
//! Wire format is a sequence of TLV units, each `type: u16 be || length:
//! u16 be || value`. A [`KeyExchangeMessage`] serialises to a fixed-order
//! sequence of such units; repeated units (members, nonces, ephemeral keys)
//! keep their positional wire order.

use ed25519_dalek::VerifyingKey;

use crate::aske::{FlowDirection, KeyAgreement, KeyExchangeMessage};
use crate::types::{
    ConclaveError, Result, NONCE_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};

/// Size of a TLV unit header in bytes.
pub const TLV_HEADER_SIZE: usize = 4;

/// TLV type: message source participant.
pub const TLV_SOURCE: u16 = 0x0100;
/// TLV type: message destination participant (absent value means broadcast).
pub const TLV_DEST: u16 = 0x0101;
/// TLV type: agreement kind (one byte, `0x00` initial / `0x01` auxiliary).
pub const TLV_AGREEMENT: u16 = 0x0102;
/// TLV type: flow direction (one byte, `0x00` upflow / `0x01` downflow).
pub const TLV_FLOW: u16 = 0x0103;
/// TLV type: one member id; repeated, positional.
pub const TLV_MEMBER: u16 = 0x0104;
/// TLV type: intermediate DH key of the companion group key agreement.
/// Tolerated and skipped on decode; never produced here.
pub const TLV_INT_KEY: u16 = 0x0105;
/// TLV type: one member nonce; repeated, positional.
pub const TLV_NONCE: u16 = 0x0106;
/// TLV type: one ephemeral public key; repeated, positional.
pub const TLV_EPHEMERAL_KEY: u16 = 0x0107;
/// TLV type: session acknowledgement signature.
pub const TLV_SESSION_SIGNATURE: u16 = 0x0108;

const AGREEMENT_INITIAL: u8 = 0x00;
const AGREEMENT_AUXILIARY: u8 = 0x01;
const FLOW_UPFLOW: u8 = 0x00;
const FLOW_DOWNFLOW: u8 = 0x01;

/// Encodes one TLV unit.
///
/// # Arguments
/// * `unit_type` - the 16-bit type tag
/// * `value` - the value bytes; an empty value encodes to length zero
pub fn encode_tlv(unit_type: u16, value: &[u8]) -> Result<Vec<u8>> {
    if value.len() > u16::MAX as usize {
        return Err(ConclaveError::InvalidInput(format!(
            "TLV value too long: {} bytes",
            value.len()
        )));
    }
    let mut data = Vec::with_capacity(TLV_HEADER_SIZE + value.len());
    data.extend_from_slice(&unit_type.to_be_bytes());
    data.extend_from_slice(&(value.len() as u16).to_be_bytes());
    data.extend_from_slice(value);
    Ok(data)
}

/// Decodes the first TLV unit of `data`.
///
/// # Returns
/// `(type, value, rest)` where `value` is `None` for a zero-length unit and
/// `rest` may contain further units.
pub fn decode_tlv(data: &[u8]) -> Result<(u16, Option<&[u8]>, &[u8])> {
    if data.len() < TLV_HEADER_SIZE {
        return Err(ConclaveError::MalformedTlv(format!(
            "Truncated header: {} bytes",
            data.len()
        )));
    }
    let unit_type = u16::from_be_bytes([data[0], data[1]]);
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    let body = &data[TLV_HEADER_SIZE..];
    if body.len() < length {
        return Err(ConclaveError::MalformedTlv(format!(
            "Value truncated: expected {} bytes, have {}",
            length,
            body.len()
        )));
    }
    let value = if length == 0 { None } else { Some(&body[..length]) };
    Ok((unit_type, value, &body[length..]))
}

/// Serialises a key-exchange message as a TLV sequence.
///
/// Unit order: source, dest, agreement, flow, members, nonces, ephemeral
/// keys, then the session signature if present.
pub fn encode_key_exchange(message: &KeyExchangeMessage) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.extend(encode_tlv(TLV_SOURCE, message.source.as_bytes())?);
    data.extend(encode_tlv(TLV_DEST, message.dest.as_bytes())?);
    let agreement = match message.agreement {
        KeyAgreement::Initial => AGREEMENT_INITIAL,
        KeyAgreement::Auxiliary => AGREEMENT_AUXILIARY,
    };
    data.extend(encode_tlv(TLV_AGREEMENT, &[agreement])?);
    let flow = match message.flow {
        FlowDirection::Upflow => FLOW_UPFLOW,
        FlowDirection::Downflow => FLOW_DOWNFLOW,
    };
    data.extend(encode_tlv(TLV_FLOW, &[flow])?);
    for member in &message.members {
        data.extend(encode_tlv(TLV_MEMBER, member.as_bytes())?);
    }
    for nonce in &message.nonces {
        data.extend(encode_tlv(TLV_NONCE, nonce)?);
    }
    for key in &message.ephemeral_keys {
        data.extend(encode_tlv(TLV_EPHEMERAL_KEY, key.as_bytes())?);
    }
    if let Some(signature) = &message.session_signature {
        data.extend(encode_tlv(TLV_SESSION_SIGNATURE, signature)?);
    }
    Ok(data)
}

/// Parses a TLV sequence back into a key-exchange message.
///
/// Singleton fields (source, dest, agreement, flow, signature) may appear
/// at most once; source, agreement and flow are required. Repeated fields
/// keep wire order.
pub fn decode_key_exchange(data: &[u8]) -> Result<KeyExchangeMessage> {
    let mut source: Option<String> = None;
    let mut dest: Option<String> = None;
    let mut agreement: Option<KeyAgreement> = None;
    let mut flow: Option<FlowDirection> = None;
    let mut members: Vec<String> = Vec::new();
    let mut nonces: Vec<Vec<u8>> = Vec::new();
    let mut ephemeral_keys: Vec<VerifyingKey> = Vec::new();
    let mut session_signature: Option<[u8; SIGNATURE_SIZE]> = None;

    let mut rest = data;
    while !rest.is_empty() {
        let (unit_type, value, remainder) = decode_tlv(rest)?;
        rest = remainder;
        let value = value.unwrap_or(&[]);

        match unit_type {
            TLV_SOURCE => {
                set_once(&mut source, utf8_value("source", value)?, "source")?;
            }
            TLV_DEST => {
                set_once(&mut dest, utf8_value("dest", value)?, "dest")?;
            }
            TLV_AGREEMENT => {
                let kind = match value {
                    [AGREEMENT_INITIAL] => KeyAgreement::Initial,
                    [AGREEMENT_AUXILIARY] => KeyAgreement::Auxiliary,
                    other => {
                        return Err(ConclaveError::MalformedMessage(format!(
                            "Invalid agreement value: {}",
                            hex::encode(other)
                        )))
                    }
                };
                set_once(&mut agreement, kind, "agreement")?;
            }
            TLV_FLOW => {
                let direction = match value {
                    [FLOW_UPFLOW] => FlowDirection::Upflow,
                    [FLOW_DOWNFLOW] => FlowDirection::Downflow,
                    other => {
                        return Err(ConclaveError::MalformedMessage(format!(
                            "Invalid flow value: {}",
                            hex::encode(other)
                        )))
                    }
                };
                set_once(&mut flow, direction, "flow")?;
            }
            TLV_MEMBER => {
                members.push(utf8_value("member", value)?);
            }
            TLV_NONCE => {
                if value.len() != NONCE_SIZE {
                    return Err(ConclaveError::MalformedMessage(format!(
                        "Nonce must be {} bytes, got {}",
                        NONCE_SIZE,
                        value.len()
                    )));
                }
                nonces.push(value.to_vec());
            }
            TLV_EPHEMERAL_KEY => {
                let bytes: [u8; PUBLIC_KEY_SIZE] = value.try_into().map_err(|_| {
                    ConclaveError::MalformedMessage(format!(
                        "Ephemeral key must be {} bytes, got {}",
                        PUBLIC_KEY_SIZE,
                        value.len()
                    ))
                })?;
                let key = VerifyingKey::from_bytes(&bytes).map_err(|e| {
                    ConclaveError::MalformedMessage(format!("Invalid ephemeral key: {e}"))
                })?;
                ephemeral_keys.push(key);
            }
            TLV_SESSION_SIGNATURE => {
                let signature: [u8; SIGNATURE_SIZE] = value.try_into().map_err(|_| {
                    ConclaveError::MalformedMessage(format!(
                        "Session signature must be {} bytes, got {}",
                        SIGNATURE_SIZE,
                        value.len()
                    ))
                })?;
                set_once(&mut session_signature, signature, "session signature")?;
            }
            TLV_INT_KEY => {
                // Belongs to the parallel DH agreement; not modeled here.
            }
            other => {
                return Err(ConclaveError::MalformedMessage(format!(
                    "Unexpected TLV type 0x{other:04x}"
                )));
            }
        }
    }

    let source = source.ok_or_else(|| {
        ConclaveError::MalformedMessage("Missing source".to_string())
    })?;
    let agreement = agreement.ok_or_else(|| {
        ConclaveError::MalformedMessage("Missing agreement kind".to_string())
    })?;
    let flow = flow.ok_or_else(|| {
        ConclaveError::MalformedMessage("Missing flow direction".to_string())
    })?;

    Ok(KeyExchangeMessage {
        source,
        dest: dest.unwrap_or_default(),
        agreement,
        flow,
        members,
        nonces,
        ephemeral_keys,
        session_signature,
    })
}

fn utf8_value(field: &str, value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|_| {
        ConclaveError::MalformedMessage(format!("Invalid UTF-8 in {field}"))
    })
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &str) -> Result<()> {
    if slot.is_some() {
        return Err(ConclaveError::MalformedMessage(format!(
            "Duplicate {field} field"
        )));
    }
    *slot = Some(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keypair_from_seed;

    #[test]
    fn test_tlv_encode() {
        let encoded = encode_tlv(0x002A, b"Don't panic!").unwrap();
        let mut expected = vec![0x00, 0x2A, 0x00, 0x0C];
        expected.extend_from_slice(b"Don't panic!");
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_tlv_decode() {
        let mut data = vec![0x00, 0x2A, 0x00, 0x0C];
        data.extend_from_slice(b"Don't panic!");
        let (unit_type, value, rest) = decode_tlv(&data).unwrap();
        assert_eq!(unit_type, 42);
        assert_eq!(value, Some(&b"Don't panic!"[..]));
        assert!(rest.is_empty());
    }

    #[test]
    fn test_tlv_decode_concatenated() {
        let mut data = encode_tlv(0, b"hello").unwrap();
        data.extend(encode_tlv(0, b"world").unwrap());

        let (unit_type, value, rest) = decode_tlv(&data).unwrap();
        assert_eq!(unit_type, 0);
        assert_eq!(value, Some(&b"hello"[..]));
        assert_eq!(rest.len(), TLV_HEADER_SIZE + 5);

        let (unit_type, value, rest) = decode_tlv(rest).unwrap();
        assert_eq!(unit_type, 0);
        assert_eq!(value, Some(&b"world"[..]));
        assert!(rest.is_empty());
    }

    #[test]
    fn test_tlv_decode_truncated_value() {
        let mut data = vec![0x00, 0x00, 0x00, 0x05];
        data.extend_from_slice(b"hell");
        let result = decode_tlv(&data);
        assert!(matches!(result, Err(ConclaveError::MalformedTlv(_))));
    }

    #[test]
    fn test_tlv_decode_truncated_header() {
        let result = decode_tlv(&[0x00, 0x2A]);
        assert!(matches!(result, Err(ConclaveError::MalformedTlv(_))));
    }

    #[test]
    fn test_tlv_empty_value() {
        let encoded = encode_tlv(0x0101, b"").unwrap();
        assert_eq!(encoded, vec![0x01, 0x01, 0x00, 0x00]);
        let (unit_type, value, rest) = decode_tlv(&encoded).unwrap();
        assert_eq!(unit_type, 0x0101);
        assert_eq!(value, None);
        assert!(rest.is_empty());
    }

    fn sample_message() -> KeyExchangeMessage {
        let (_, key_a) = keypair_from_seed(&[0x11; 32]).unwrap();
        let (_, key_b) = keypair_from_seed(&[0x22; 32]).unwrap();
        KeyExchangeMessage {
            source: "alice".to_string(),
            dest: String::new(),
            agreement: KeyAgreement::Initial,
            flow: FlowDirection::Downflow,
            members: vec!["alice".to_string(), "bob".to_string()],
            nonces: vec![vec![0x01; NONCE_SIZE], vec![0x02; NONCE_SIZE]],
            ephemeral_keys: vec![key_a, key_b],
            session_signature: Some([0xCD; SIGNATURE_SIZE]),
        }
    }

    #[test]
    fn test_key_exchange_roundtrip() {
        let message = sample_message();
        let encoded = encode_key_exchange(&message).unwrap();
        let decoded = decode_key_exchange(&encoded).unwrap();

        assert_eq!(decoded.source, message.source);
        assert_eq!(decoded.dest, message.dest);
        assert_eq!(decoded.agreement, message.agreement);
        assert_eq!(decoded.flow, message.flow);
        assert_eq!(decoded.members, message.members);
        assert_eq!(decoded.nonces, message.nonces);
        assert_eq!(decoded.ephemeral_keys, message.ephemeral_keys);
        assert_eq!(decoded.session_signature, message.session_signature);
    }

    #[test]
    fn test_key_exchange_upflow_roundtrip() {
        let mut message = sample_message();
        message.flow = FlowDirection::Upflow;
        message.agreement = KeyAgreement::Auxiliary;
        message.dest = "bob".to_string();
        message.session_signature = None;

        let decoded = decode_key_exchange(&encode_key_exchange(&message).unwrap()).unwrap();
        assert_eq!(decoded.flow, FlowDirection::Upflow);
        assert_eq!(decoded.agreement, KeyAgreement::Auxiliary);
        assert_eq!(decoded.dest, "bob");
        assert!(decoded.session_signature.is_none());
    }

    #[test]
    fn test_decode_missing_source() {
        let data = encode_tlv(TLV_FLOW, &[FLOW_UPFLOW]).unwrap();
        let result = decode_key_exchange(&data);
        assert!(matches!(result, Err(ConclaveError::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_duplicate_flow() {
        let mut data = encode_tlv(TLV_SOURCE, b"alice").unwrap();
        data.extend(encode_tlv(TLV_FLOW, &[FLOW_UPFLOW]).unwrap());
        data.extend(encode_tlv(TLV_FLOW, &[FLOW_DOWNFLOW]).unwrap());
        let result = decode_key_exchange(&data);
        assert!(matches!(result, Err(ConclaveError::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_bad_nonce_size() {
        let mut data = encode_tlv(TLV_SOURCE, b"alice").unwrap();
        data.extend(encode_tlv(TLV_FLOW, &[FLOW_UPFLOW]).unwrap());
        data.extend(encode_tlv(TLV_NONCE, &[0u8; 16]).unwrap());
        let result = decode_key_exchange(&data);
        assert!(matches!(result, Err(ConclaveError::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_skips_int_keys() {
        let mut data = encode_tlv(TLV_SOURCE, b"alice").unwrap();
        data.extend(encode_tlv(TLV_AGREEMENT, &[AGREEMENT_INITIAL]).unwrap());
        data.extend(encode_tlv(TLV_INT_KEY, &[0xEE; 32]).unwrap());
        data.extend(encode_tlv(TLV_FLOW, &[FLOW_UPFLOW]).unwrap());
        let decoded = decode_key_exchange(&data).unwrap();
        assert_eq!(decoded.source, "alice");
        assert!(decoded.members.is_empty());
    }

    #[test]
    fn test_decode_missing_agreement() {
        let mut data = encode_tlv(TLV_SOURCE, b"alice").unwrap();
        data.extend(encode_tlv(TLV_FLOW, &[FLOW_UPFLOW]).unwrap());
        let result = decode_key_exchange(&data);
        assert!(matches!(result, Err(ConclaveError::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_bad_agreement_value() {
        let mut data = encode_tlv(TLV_SOURCE, b"alice").unwrap();
        data.extend(encode_tlv(TLV_AGREEMENT, &[0x07]).unwrap());
        let result = decode_key_exchange(&data);
        assert!(matches!(result, Err(ConclaveError::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut data = encode_tlv(TLV_SOURCE, b"alice").unwrap();
        data.extend(encode_tlv(0x7777, b"x").unwrap());
        let result = decode_key_exchange(&data);
        assert!(matches!(result, Err(ConclaveError::MalformedMessage(_))));
    }

    #[test]
    fn test_broadcast_dest_roundtrip() {
        // Broadcast encodes as an empty dest unit and decodes back to "".
        let message = sample_message();
        let encoded = encode_key_exchange(&message).unwrap();
        let decoded = decode_key_exchange(&encoded).unwrap();
        assert_eq!(decoded.dest, "");
    }
}
