use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Failure domain of a replica. Replicas in the same zone share a
/// site-multicast scope for phase 2.
pub type Zone = u16;

/// Site-aware identifier of a replica or client: a `(zone, node)` pair
/// rendered as `"zone.node"`. The total order (zone first, node second) is
/// used as a tiebreak wherever a deterministic choice between replicas is
/// needed.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
pub struct ID {
    zone: Zone,
    node: u16,
}

impl ID {
    /// Creates an identifier from its zone and node numbers.
    pub fn new(zone: Zone, node: u16) -> ID {
        ID { zone, node }
    }

    /// Canonical identifier of a site: node 1 of the zone. Used where a
    /// whole site is counted as one party, e.g. access-locality tracking.
    pub fn site(zone: Zone) -> ID {
        ID::new(zone, 1)
    }

    /// Zone this identifier belongs to.
    pub fn zone(self) -> Zone {
        self.zone
    }

    /// Node number within the zone.
    pub fn node(self) -> u16 {
        self.node
    }

    pub(crate) fn pack(self) -> u32 {
        (u32::from(self.zone) << 16) | u32::from(self.node)
    }

    pub(crate) fn unpack(v: u32) -> ID {
        ID::new((v >> 16) as u16, v as u16)
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.zone, self.node)
    }
}

impl fmt::Debug for ID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error parsing an identifier from its `"zone.node"` rendering.
#[derive(Debug, Error)]
#[error("malformed id {0:?}, expected \"zone.node\"")]
pub struct ParseIdError(String);

impl FromStr for ID {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<ID, ParseIdError> {
        let mut parts = s.splitn(2, '.');
        let zone = parts.next().and_then(|p| p.parse().ok());
        let node = parts.next().and_then(|p| p.parse().ok());
        match (zone, node) {
            (Some(zone), Some(node)) => Ok(ID::new(zone, node)),
            _ => Err(ParseIdError(s.to_string())),
        }
    }
}

// Identifiers travel as their string rendering so they can key JSON maps
// in the configuration file.
impl Serialize for ID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ID {
    fn deserialize<D>(deserializer: D) -> Result<ID, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(IdVisitor)
    }
}

struct IdVisitor;

impl<'de> de::Visitor<'de> for IdVisitor {
    type Value = ID;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an id of the form \"zone.node\"")
    }

    fn visit_str<E>(self, v: &str) -> Result<ID, E>
    where
        E: de::Error,
    {
        v.parse().map_err(de::Error::custom)
    }
}
