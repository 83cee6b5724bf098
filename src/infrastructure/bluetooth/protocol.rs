//! BikeControl Protocol
//!
//! Identity of the BikeControl peripheral and the payload codec.
//!
//! Values never cross the transport as raw bytes: they are wrapped in a
//! base64 envelope (standard alphabet, padded). Inside the envelope every
//! value is a fixed-width little-endian number:
//!
//! ```text
//! temperature   : f32 LE, 4 bytes
//! humidity      : f32 LE, 4 bytes
//! distance-left : f64 LE, 8 bytes
//! braking       : u32 LE, 4 bytes, 0 = released, 1 = braking
//! ```

use crate::domain::models::SignalKind;
use crate::infrastructure::bluetooth::LinkError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::trace;
use uuid::Uuid;

/// Advertised local name of the peripheral
pub const DEVICE_NAME: &str = "BikeControl";

/// Capability group (GATT service) holding every signal and command
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xbdb7d889_18b3_4342_b7d7_e3201e5fa3ef);

/// Temperature notification characteristic
pub const TEMPERATURE_CHAR_UUID: Uuid = Uuid::from_u128(0xf71b8d3f_eb1c_495f_9e61_b8a773f2867f);

/// Humidity notification characteristic
pub const HUMIDITY_CHAR_UUID: Uuid = Uuid::from_u128(0x8bbb426f_c7a9_4add_8037_68d290fc3875);

/// Distance-left notification characteristic
pub const DISTANCE_LEFT_CHAR_UUID: Uuid = Uuid::from_u128(0x6a0f3c2e_5d41_4b7e_9c38_1e2f4a5b6c7d);

/// Braking command characteristic (write with response)
pub const BRAKING_CHAR_UUID: Uuid = Uuid::from_u128(0xc2b4e981_089a_4a09_8241_0a73783ae4f5);

/// Characteristic carrying a given signal
pub fn signal_characteristic(kind: SignalKind) -> Uuid {
    match kind {
        SignalKind::Temperature => TEMPERATURE_CHAR_UUID,
        SignalKind::Humidity => HUMIDITY_CHAR_UUID,
        SignalKind::DistanceLeft => DISTANCE_LEFT_CHAR_UUID,
    }
}

/// Wrap raw bytes in the transport envelope
pub fn wrap_envelope(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Unwrap the transport envelope into raw bytes
pub fn unwrap_envelope(envelope: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(envelope)
}

fn unwrap_fixed<const N: usize>(envelope: &str) -> Result<[u8; N], LinkError> {
    let bytes = unwrap_envelope(envelope)?;
    trace!("Raw payload: {:02X?}", &bytes);
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| LinkError::MalformedPayload {
        expected: N,
        actual: bytes.len(),
    })
}

/// Decode a float32 payload, rounded to two decimals for display
pub fn decode_float32(envelope: &str) -> Result<f64, LinkError> {
    let value = f32::from_le_bytes(unwrap_fixed::<4>(envelope)?);
    Ok(round_to_hundredths(f64::from(value)))
}

/// Decode a float64 payload at full precision
pub fn decode_float64(envelope: &str) -> Result<f64, LinkError> {
    Ok(f64::from_le_bytes(unwrap_fixed::<8>(envelope)?))
}

/// Decode the payload of `kind` into its presented value
pub fn decode_signal(kind: SignalKind, envelope: &str) -> Result<f64, LinkError> {
    match kind {
        SignalKind::Temperature | SignalKind::Humidity => decode_float32(envelope),
        SignalKind::DistanceLeft => decode_float64(envelope),
    }
}

pub fn encode_float32(value: f32) -> String {
    wrap_envelope(&value.to_le_bytes())
}

pub fn encode_float64(value: f64) -> String {
    wrap_envelope(&value.to_le_bytes())
}

pub fn encode_uint32_le(value: u32) -> String {
    wrap_envelope(&value.to_le_bytes())
}

/// Braking command payload: 1 when active, 0 otherwise
pub fn encode_braking(active: bool) -> String {
    encode_uint32_le(u32::from(active))
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
