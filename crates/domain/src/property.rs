//! The closed set of semantic capability names.
//!
//! Every adapter entity and every configured source property names one of
//! these. Vendor-specific refinements live in the open `features`
//! vocabulary, never here.

use serde::{Deserialize, Serialize};

/// A semantic capability, independent of any vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    Illumination,
    Climate,
    Occupancy,
    Access,
    Media,
    Power,
    Water,
    Safety,
    AirQuality,
    Schedule,
    Weather,
}

impl Property {
    /// All members, in a stable order.
    pub const ALL: [Property; 11] = [
        Property::Illumination,
        Property::Climate,
        Property::Occupancy,
        Property::Access,
        Property::Media,
        Property::Power,
        Property::Water,
        Property::Safety,
        Property::AirQuality,
        Property::Schedule,
        Property::Weather,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Illumination => "illumination",
            Property::Climate => "climate",
            Property::Occupancy => "occupancy",
            Property::Access => "access",
            Property::Media => "media",
            Property::Power => "power",
            Property::Water => "water",
            Property::Safety => "safety",
            Property::AirQuality => "air_quality",
            Property::Schedule => "schedule",
            Property::Weather => "weather",
        }
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Property {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Property::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| crate::Error::Other(format!("unknown property: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&Property::AirQuality).unwrap();
        assert_eq!(json, "\"air_quality\"");
        let back: Property = serde_json::from_str("\"air_quality\"").unwrap();
        assert_eq!(back, Property::AirQuality);
    }

    #[test]
    fn from_str_round_trips_all() {
        for p in Property::ALL {
            assert_eq!(p.as_str().parse::<Property>().unwrap(), p);
        }
    }

    #[test]
    fn unknown_property_is_rejected() {
        assert!("disco_mode".parse::<Property>().is_err());
        assert!(serde_json::from_str::<Property>("\"disco_mode\"").is_err());
    }
}
