use super::types::Envelope;

/// Largest datagram the transport will emit or accept.
pub const MAX_DATAGRAM_BYTES: usize = 65_535;

/// Encodes an envelope into a datagram body.
///
/// Returns `None` when the payload cannot be serialized or exceeds the
/// datagram limit; callers treat `None` as a drop. Equal inputs always
/// produce byte-identical output.
pub fn encode(envelope: &Envelope) -> Option<Vec<u8>> {
    match bincode::serialize(envelope) {
        Ok(bytes) if bytes.len() <= MAX_DATAGRAM_BYTES => Some(bytes),
        Ok(bytes) => {
            tracing::warn!(
                "Message of kind {} encodes to {} bytes, over the {} byte datagram limit",
                envelope.message.kind(),
                bytes.len(),
                MAX_DATAGRAM_BYTES
            );
            None
        }
        Err(e) => {
            tracing::warn!("Failed to encode message: {}", e);
            None
        }
    }
}

/// Decodes a datagram body into an envelope.
///
/// Any malformed input (truncated, unknown variant tag, trailing garbage)
/// yields `None`.
pub fn decode(bytes: &[u8]) -> Option<Envelope> {
    if bytes.is_empty() || bytes.len() > MAX_DATAGRAM_BYTES {
        return None;
    }
    bincode::deserialize(bytes).ok()
}
