use anyhow::{anyhow, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub mod cluster;
pub mod cointegration;
pub mod former;

/// A tradable pair. Rendered as `SHORT,LONG` wherever it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub short_leg: String,
    pub long_leg: String,
}

impl PairKey {
    pub fn new(short_leg: impl Into<String>, long_leg: impl Into<String>) -> Self {
        Self {
            short_leg: short_leg.into(),
            long_leg: long_leg.into(),
        }
    }

    pub fn legs(&self) -> [&str; 2] {
        [&self.short_leg, &self.long_leg]
    }

    pub fn symbols(&self) -> Vec<String> {
        vec![self.short_leg.clone(), self.long_leg.clone()]
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{}", self.short_leg, self.long_leg)
    }
}

impl FromStr for PairKey {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (short_leg, long_leg) = value
            .split_once(',')
            .ok_or_else(|| anyhow!("pair key '{}' is not SHORT,LONG", value))?;
        let (short_leg, long_leg) = (short_leg.trim(), long_leg.trim());
        if short_leg.is_empty() || long_leg.is_empty() || long_leg.contains(',') {
            return Err(anyhow!("pair key '{}' is not SHORT,LONG", value));
        }
        Ok(PairKey::new(short_leg, long_leg))
    }
}

impl Serialize for PairKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PairKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_round_trips_through_text() {
        let key: PairKey = "AAPL,MSFT".parse().unwrap();
        assert_eq!(key, PairKey::new("AAPL", "MSFT"));
        assert_eq!(key.to_string(), "AAPL,MSFT");
        assert_eq!(key.legs(), ["AAPL", "MSFT"]);
    }

    #[test]
    fn malformed_pair_keys_are_rejected() {
        assert!("AAPL".parse::<PairKey>().is_err());
        assert!(",MSFT".parse::<PairKey>().is_err());
        assert!("A,B,C".parse::<PairKey>().is_err());
    }

    #[test]
    fn pair_key_serializes_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(PairKey::new("BRK.B", "JPM"), 1.25);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"BRK.B,JPM":1.25}"#);
        let back: std::collections::BTreeMap<PairKey, f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
