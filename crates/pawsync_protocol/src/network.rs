//! Connectivity observations.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Physical link type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    /// No link.
    None,
    /// Wi-Fi.
    Wifi,
    /// 2G cellular.
    Mobile2G,
    /// 3G cellular.
    Mobile3G,
    /// 4G cellular.
    Mobile4G,
    /// 5G cellular.
    Mobile5G,
    /// Wired.
    Ethernet,
}

impl ConnectionType {
    /// Cellular links.
    pub fn is_mobile(&self) -> bool {
        matches!(
            self,
            ConnectionType::Mobile2G
                | ConnectionType::Mobile3G
                | ConnectionType::Mobile4G
                | ConnectionType::Mobile5G
        )
    }
}

/// Coarse link quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionQuality {
    /// Not measured.
    Unknown,
    /// Below 50 kbps or above 1000 ms.
    Poor,
    /// Below 250 kbps or above 500 ms.
    Fair,
    /// Below 1000 kbps or above 150 ms.
    Good,
    /// Anything better.
    Excellent,
}

impl ConnectionQuality {
    /// Classifies a measurement. The worse of the two metrics wins.
    pub fn classify(bandwidth_kbps: Option<u32>, latency_ms: Option<u32>) -> Self {
        if bandwidth_kbps.is_none() && latency_ms.is_none() {
            return ConnectionQuality::Unknown;
        }
        let by_bandwidth = match bandwidth_kbps {
            None => ConnectionQuality::Excellent,
            Some(b) if b < 50 => ConnectionQuality::Poor,
            Some(b) if b < 250 => ConnectionQuality::Fair,
            Some(b) if b < 1000 => ConnectionQuality::Good,
            Some(_) => ConnectionQuality::Excellent,
        };
        let by_latency = match latency_ms {
            None => ConnectionQuality::Excellent,
            Some(l) if l > 1000 => ConnectionQuality::Poor,
            Some(l) if l > 500 => ConnectionQuality::Fair,
            Some(l) if l > 150 => ConnectionQuality::Good,
            Some(_) => ConnectionQuality::Excellent,
        };
        by_bandwidth.min(by_latency)
    }
}

/// A point-in-time connectivity observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStateSample {
    /// Whether any link is up.
    pub is_connected: bool,
    /// Link type.
    pub connection_type: ConnectionType,
    /// Classified quality.
    pub connection_quality: ConnectionQuality,
    /// Whether traffic is billed by volume.
    pub is_metered: bool,
    /// Measured bandwidth.
    pub bandwidth_kbps: Option<u32>,
    /// Measured round trip.
    pub latency_ms: Option<u32>,
    /// When the sample was taken.
    pub timestamp: Timestamp,
}

impl NetworkStateSample {
    /// A sample with no link.
    pub fn disconnected(timestamp: Timestamp) -> Self {
        Self {
            is_connected: false,
            connection_type: ConnectionType::None,
            connection_quality: ConnectionQuality::Unknown,
            is_metered: false,
            bandwidth_kbps: None,
            latency_ms: None,
            timestamp,
        }
    }

    /// A connected sample. Mobile links are treated as metered.
    pub fn connected(
        connection_type: ConnectionType,
        bandwidth_kbps: Option<u32>,
        latency_ms: Option<u32>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            is_connected: connection_type != ConnectionType::None,
            connection_type,
            connection_quality: ConnectionQuality::classify(bandwidth_kbps, latency_ms),
            is_metered: connection_type.is_mobile(),
            bandwidth_kbps,
            latency_ms,
            timestamp,
        }
    }

    /// Overrides the metered flag.
    #[must_use]
    pub fn with_metered(mut self, metered: bool) -> Self {
        self.is_metered = metered;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn classify_thresholds() {
        assert_eq!(ConnectionQuality::classify(None, None), ConnectionQuality::Unknown);
        assert_eq!(ConnectionQuality::classify(Some(40), Some(20)), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::classify(Some(5000), Some(1200)), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::classify(Some(200), None), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::classify(Some(800), Some(100)), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::classify(Some(5000), Some(30)), ConnectionQuality::Excellent);
    }

    #[test]
    fn mobile_is_metered() {
        let s = NetworkStateSample::connected(ConnectionType::Mobile4G, Some(2000), Some(60), 1);
        assert!(s.is_connected);
        assert!(s.is_metered);
        let w = NetworkStateSample::connected(ConnectionType::Wifi, None, None, 1);
        assert!(!w.is_metered);
        assert_eq!(w.connection_quality, ConnectionQuality::Unknown);
        assert!(!NetworkStateSample::disconnected(2).is_connected);
    }

    proptest! {
        #[test]
        fn more_bandwidth_never_degrades(b in 0u32..5000, extra in 0u32..5000, l in 0u32..2000) {
            let base = ConnectionQuality::classify(Some(b), Some(l));
            let better = ConnectionQuality::classify(Some(b + extra), Some(l));
            prop_assert!(better >= base);
        }
    }
}
