//! Channel mappings and the mapping gate.
//!
//! Every (room type, rate plan) pair that is pushed to or booked from a
//! channel needs an active mapping to a channel product code. Validation
//! reports every gap at once so an operator can fix them in one pass.

use crate::{ConnectionId, ProductCode, RatePlanId, RoomTypeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// A local (room type, rate plan) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingPair {
    pub room_type: RoomTypeId,
    pub rate_plan: RatePlanId,
}

impl MappingPair {
    pub fn new(room_type: impl Into<RoomTypeId>, rate_plan: impl Into<RatePlanId>) -> Self {
        Self {
            room_type: room_type.into(),
            rate_plan: rate_plan.into(),
        }
    }
}

impl fmt::Display for MappingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_type, self.rate_plan)
    }
}

/// Operator-maintained mapping of a local pair to a channel product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMapping {
    pub connection_id: ConnectionId,
    pub room_type: RoomTypeId,
    pub rate_plan: RatePlanId,
    pub product_code: ProductCode,
    pub active: bool,
}

impl ChannelMapping {
    pub fn new(
        connection_id: impl Into<ConnectionId>,
        room_type: impl Into<RoomTypeId>,
        rate_plan: impl Into<RatePlanId>,
        product_code: impl Into<ProductCode>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            room_type: room_type.into(),
            rate_plan: rate_plan.into(),
            product_code: product_code.into(),
            active: true,
        }
    }

    pub fn pair(&self) -> MappingPair {
        MappingPair::new(self.room_type.clone(), self.rate_plan.clone())
    }
}

/// Every pair that lacked an active mapping, in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MissingMappings(pub Vec<MappingPair>);

impl MissingMappings {
    pub fn new(mut pairs: Vec<MappingPair>) -> Self {
        pairs.sort();
        pairs.dedup();
        Self(pairs)
    }

    pub fn pairs(&self) -> &[MappingPair] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MissingMappings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("missing channel mappings: ")?;
        for (i, pair) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{pair}")?;
        }
        Ok(())
    }
}

/// The mapping table of one connection.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    by_pair: HashMap<MappingPair, ChannelMapping>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from stored rows. Later rows replace earlier ones.
    pub fn from_mappings(mappings: impl IntoIterator<Item = ChannelMapping>) -> Self {
        let mut table = Self::new();
        for mapping in mappings {
            table.upsert(mapping);
        }
        table
    }

    pub fn upsert(&mut self, mapping: ChannelMapping) {
        self.by_pair.insert(mapping.pair(), mapping);
    }

    /// Active product code for a pair.
    pub fn product_code(&self, pair: &MappingPair) -> Option<&ProductCode> {
        self.by_pair
            .get(pair)
            .filter(|m| m.active)
            .map(|m| &m.product_code)
    }

    /// Reverse lookup of an active mapping by product code.
    pub fn resolve(&self, product_code: &str) -> Option<MappingPair> {
        self.by_pair
            .values()
            .find(|m| m.active && m.product_code == product_code)
            .map(ChannelMapping::pair)
    }

    /// Check that every pair has an active mapping.
    ///
    /// Collects all gaps instead of stopping at the first one.
    pub fn validate<'a>(
        &self,
        pairs: impl IntoIterator<Item = &'a MappingPair>,
    ) -> std::result::Result<(), MissingMappings> {
        let missing: BTreeSet<MappingPair> = pairs
            .into_iter()
            .filter(|pair| self.product_code(pair).is_none())
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(MissingMappings(missing.into_iter().collect()))
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &ChannelMapping> {
        self.by_pair.values().filter(|m| m.active)
    }

    pub fn len(&self) -> usize {
        self.by_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pair.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MappingTable {
        let mut inactive = ChannelMapping::new("c1", "dlx", "bar", "DLX-BAR");
        inactive.active = false;
        MappingTable::from_mappings(vec![
            ChannelMapping::new("c1", "std", "bar", "STD-BAR"),
            ChannelMapping::new("c1", "std", "nr", "STD-NR"),
            inactive,
        ])
    }

    #[test]
    fn validate_passes_when_all_mapped() {
        let pairs = vec![MappingPair::new("std", "bar"), MappingPair::new("std", "nr")];
        assert!(table().validate(&pairs).is_ok());
    }

    #[test]
    fn validate_reports_every_gap() {
        let pairs = vec![
            MappingPair::new("suite", "bar"),
            MappingPair::new("std", "bar"),
            MappingPair::new("dlx", "bar"),
            MappingPair::new("suite", "bar"),
        ];
        let missing = table().validate(&pairs).unwrap_err();
        assert_eq!(
            missing.pairs(),
            &[MappingPair::new("dlx", "bar"), MappingPair::new("suite", "bar")]
        );
    }

    #[test]
    fn inactive_mapping_is_a_gap() {
        let table = table();
        assert!(table.product_code(&MappingPair::new("dlx", "bar")).is_none());
        assert!(table.resolve("DLX-BAR").is_none());
        assert_eq!(table.resolve("STD-NR"), Some(MappingPair::new("std", "nr")));
        assert_eq!(table.active().count(), 2);
    }

    #[test]
    fn upsert_replaces_product_code() {
        let mut table = table();
        table.upsert(ChannelMapping::new("c1", "std", "bar", "STD-BAR-2"));
        assert_eq!(
            table.product_code(&MappingPair::new("std", "bar")).unwrap(),
            "STD-BAR-2"
        );
        assert_eq!(table.len(), 3);
    }
}
