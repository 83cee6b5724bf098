use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the single peripheral link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Notifiable values exposed by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// Air temperature, degrees Celsius (float32 payload)
    Temperature,
    /// Relative humidity, percent (float32 payload)
    Humidity,
    /// Distance to the nearest obstacle on the left (float64 payload)
    DistanceLeft,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [Self::Temperature, Self::Humidity, Self::DistanceLeft];
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::DistanceLeft => "distance-left",
        };
        f.write_str(s)
    }
}

/// A decoded value tagged by the signal it came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub kind: SignalKind,
    pub value: f64,
}

impl Reading {
    pub fn new(kind: SignalKind, value: f64) -> Self {
        Self { kind, value }
    }
}
