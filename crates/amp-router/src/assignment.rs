//! Display channel assignment
//!
//! The table decides which amplifier owns each display channel and which of
//! its physical channels backs it:
//!
//! - owner = per-channel address override, else the default address
//! - physical = per-channel number override, else the display index
//!
//! The router derives the set of device sessions it must keep open from the
//! same table, so ownership and session lifecycle never disagree.

use std::collections::{BTreeMap, BTreeSet};

use amp_protocol::{is_valid_channel, ChannelKind};
use serde::{Deserialize, Serialize};

use crate::channel::DisplayChannel;
use crate::error::RouterError;
use crate::state::DeviceAddress;

/// Overrides for one display channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAssignment {
    /// Device that owns the channel instead of the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
    /// Physical channel to read instead of the display index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical: Option<u8>,
}

impl ChannelAssignment {
    fn is_empty(&self) -> bool {
        self.address.is_none() && self.physical.is_none()
    }
}

/// Where a display channel is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub address: DeviceAddress,
    pub physical: u8,
}

/// Default device plus per-channel overrides
///
/// Deserializing checks every physical channel, so a table loaded from disk
/// holds the same invariants as one built through the setters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredTable")]
pub struct AssignmentTable {
    default_address: Option<DeviceAddress>,
    channels: BTreeMap<DisplayChannel, ChannelAssignment>,
}

/// Unchecked form of [`AssignmentTable`] as it appears in a settings file
#[derive(Deserialize)]
struct StoredTable {
    #[serde(default)]
    default_address: Option<DeviceAddress>,
    #[serde(default)]
    channels: BTreeMap<DisplayChannel, ChannelAssignment>,
}

impl TryFrom<StoredTable> for AssignmentTable {
    type Error = RouterError;

    fn try_from(stored: StoredTable) -> Result<Self, Self::Error> {
        let mut channels = stored.channels;
        channels.retain(|_, entry| !entry.is_empty());
        let table = Self {
            default_address: stored.default_address,
            channels,
        };
        table.validate()?;
        Ok(table)
    }
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with only a default device
    pub fn with_default(address: DeviceAddress) -> Self {
        Self {
            default_address: Some(address),
            channels: BTreeMap::new(),
        }
    }

    pub fn default_address(&self) -> Option<&DeviceAddress> {
        self.default_address.as_ref()
    }

    /// Check every override names a real display channel and physical channel
    pub fn validate(&self) -> Result<(), RouterError> {
        for (&channel, entry) in &self.channels {
            check_channel(channel)?;
            check_physical(channel, entry.physical)?;
        }
        Ok(())
    }

    /// Replace the default device. Returns true if it changed.
    pub fn set_default_address(&mut self, address: Option<DeviceAddress>) -> bool {
        if self.default_address == address {
            return false;
        }
        self.default_address = address;
        true
    }

    /// Current overrides for `channel` (empty if none)
    pub fn assignment(&self, channel: DisplayChannel) -> ChannelAssignment {
        self.channels.get(&channel).cloned().unwrap_or_default()
    }

    /// Assign `channel` to a device, or back to the default with `None`.
    /// Returns true if the table changed.
    pub fn set_assignment(
        &mut self,
        channel: DisplayChannel,
        address: Option<DeviceAddress>,
    ) -> Result<bool, RouterError> {
        check_channel(channel)?;
        Ok(self.update(channel, |entry| {
            let changed = entry.address != address;
            entry.address = address;
            changed
        }))
    }

    /// Override the physical channel behind `channel`, or clear it with `None`.
    /// Returns true if the table changed.
    pub fn set_channel_number(
        &mut self,
        channel: DisplayChannel,
        physical: Option<u8>,
    ) -> Result<bool, RouterError> {
        check_channel(channel)?;
        check_physical(channel, physical)?;
        Ok(self.update(channel, |entry| {
            let changed = entry.physical != physical;
            entry.physical = physical;
            changed
        }))
    }

    fn update(
        &mut self,
        channel: DisplayChannel,
        apply: impl FnOnce(&mut ChannelAssignment) -> bool,
    ) -> bool {
        let entry = self.channels.entry(channel).or_default();
        let changed = apply(entry);
        if entry.is_empty() {
            self.channels.remove(&channel);
        }
        changed
    }

    /// Device that owns `channel`, if any
    pub fn owner_of(&self, channel: DisplayChannel) -> Option<&DeviceAddress> {
        self.channels
            .get(&channel)
            .and_then(|a| a.address.as_ref())
            .or(self.default_address.as_ref())
    }

    /// Physical channel that backs `channel`
    pub fn physical_of(&self, channel: DisplayChannel) -> u8 {
        self.channels
            .get(&channel)
            .and_then(|a| a.physical)
            .unwrap_or(channel.index)
    }

    /// Owner and physical channel for `channel`
    pub fn route(&self, channel: DisplayChannel) -> Option<Route> {
        self.owner_of(channel).map(|address| Route {
            address: address.clone(),
            physical: self.physical_of(channel),
        })
    }

    /// True if `address` owns `channel`
    pub fn owns(&self, address: &DeviceAddress, channel: DisplayChannel) -> bool {
        self.owner_of(channel) == Some(address)
    }

    /// Devices that need an open session: the default plus every assigned device
    pub fn required_addresses(&self) -> BTreeSet<DeviceAddress> {
        self.default_address
            .iter()
            .chain(self.channels.values().filter_map(|a| a.address.as_ref()))
            .cloned()
            .collect()
    }

    /// Display channels owned by `address`, with their physical channel
    pub fn owned_channels(&self, address: &DeviceAddress) -> Vec<(DisplayChannel, u8)> {
        DisplayChannel::ALL
            .into_iter()
            .filter(|&c| self.owns(address, c))
            .map(|c| (c, self.physical_of(c)))
            .collect()
    }

    /// Display channels a reading of `(kind, physical)` from `address` belongs to
    ///
    /// More than one display channel may map to the same physical channel.
    pub fn display_channels_for(
        &self,
        address: &DeviceAddress,
        kind: ChannelKind,
        physical: u8,
    ) -> Vec<DisplayChannel> {
        DisplayChannel::ALL
            .into_iter()
            .filter(|c| c.kind == kind)
            .filter(|&c| self.physical_of(c) == physical && self.owns(address, c))
            .collect()
    }

    /// Channels with at least one override
    pub fn overrides(&self) -> impl Iterator<Item = (DisplayChannel, &ChannelAssignment)> {
        self.channels.iter().map(|(c, a)| (*c, a))
    }
}

fn check_channel(channel: DisplayChannel) -> Result<(), RouterError> {
    if channel.is_valid() {
        Ok(())
    } else {
        Err(RouterError::InvalidChannel(channel.to_string()))
    }
}

fn check_physical(channel: DisplayChannel, physical: Option<u8>) -> Result<(), RouterError> {
    match physical {
        Some(n) if !is_valid_channel(n) => Err(RouterError::InvalidChannel(format!(
            "physical channel {n} for {channel}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str) -> DeviceAddress {
        DeviceAddress::with_default_port(host)
    }

    /// Default A, input1 on B, input2 backed by physical 3
    fn split_table() -> AssignmentTable {
        let mut table = AssignmentTable::with_default(addr("10.0.0.1"));
        table
            .set_assignment(DisplayChannel::input(1), Some(addr("10.0.0.2")))
            .unwrap();
        table
            .set_channel_number(DisplayChannel::input(2), Some(3))
            .unwrap();
        table
    }

    #[test]
    fn test_empty_table_owns_nothing() {
        let table = AssignmentTable::new();
        assert!(table.required_addresses().is_empty());
        assert_eq!(table.owner_of(DisplayChannel::input(1)), None);
        assert_eq!(table.route(DisplayChannel::output(4)), None);
    }

    #[test]
    fn test_owner_and_physical_resolution() {
        let table = split_table();
        assert_eq!(
            table.route(DisplayChannel::input(1)),
            Some(Route {
                address: addr("10.0.0.2"),
                physical: 1
            })
        );
        assert_eq!(
            table.route(DisplayChannel::input(2)),
            Some(Route {
                address: addr("10.0.0.1"),
                physical: 3
            })
        );
        assert_eq!(
            table.owner_of(DisplayChannel::output(3)),
            Some(&addr("10.0.0.1"))
        );
    }

    #[test]
    fn test_required_addresses() {
        let table = split_table();
        let required: Vec<_> = table.required_addresses().into_iter().collect();
        assert_eq!(required, vec![addr("10.0.0.1"), addr("10.0.0.2")]);

        // Assigned devices stay required without a default
        let mut table = table;
        table.set_default_address(None);
        let required: Vec<_> = table.required_addresses().into_iter().collect();
        assert_eq!(required, vec![addr("10.0.0.2")]);
    }

    #[test]
    fn test_display_channels_for_filters_by_owner() {
        let table = split_table();
        let a = addr("10.0.0.1");
        let b = addr("10.0.0.2");

        // A's physical input 1 backs no display channel: input1 belongs to B
        assert!(table
            .display_channels_for(&a, ChannelKind::Input, 1)
            .is_empty());
        assert_eq!(
            table.display_channels_for(&b, ChannelKind::Input, 1),
            vec![DisplayChannel::input(1)]
        );
        // input2 reads physical 3, and so does input3
        assert_eq!(
            table.display_channels_for(&a, ChannelKind::Input, 3),
            vec![DisplayChannel::input(2), DisplayChannel::input(3)]
        );
        assert!(table
            .display_channels_for(&b, ChannelKind::Output, 1)
            .is_empty());
    }

    #[test]
    fn test_owned_channels() {
        let table = split_table();
        let owned = table.owned_channels(&addr("10.0.0.2"));
        assert_eq!(owned, vec![(DisplayChannel::input(1), 1)]);
        assert_eq!(table.owned_channels(&addr("10.0.0.1")).len(), 7);
    }

    #[test]
    fn test_set_reports_changes_and_prunes() {
        let mut table = split_table();
        assert_eq!(
            table.set_assignment(DisplayChannel::input(1), Some(addr("10.0.0.2"))),
            Ok(false)
        );
        assert_eq!(table.set_assignment(DisplayChannel::input(1), None), Ok(true));
        assert_eq!(
            table.set_channel_number(DisplayChannel::input(2), None),
            Ok(true)
        );
        assert_eq!(table.overrides().count(), 0);
        assert_eq!(
            table.required_addresses().into_iter().collect::<Vec<_>>(),
            vec![addr("10.0.0.1")]
        );
    }

    #[test]
    fn test_invalid_channels_rejected() {
        let mut table = AssignmentTable::new();
        assert!(matches!(
            table.set_assignment(DisplayChannel::input(5), Some(addr("x"))),
            Err(RouterError::InvalidChannel(_))
        ));
        assert!(matches!(
            table.set_channel_number(DisplayChannel::output(1), Some(0)),
            Err(RouterError::InvalidChannel(_))
        ));
        assert!(matches!(
            table.set_channel_number(DisplayChannel::output(1), Some(5)),
            Err(RouterError::InvalidChannel(_))
        ));
        assert_eq!(table, AssignmentTable::new());
    }

    #[test]
    fn test_serde_roundtrip() {
        let table = split_table();
        let json = serde_json::to_string(&table).unwrap();
        assert!(json.contains("\"input1\""));
        let back: AssignmentTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_deserialize_rejects_bad_physical() {
        let json = serde_json::json!({
            "default_address": "10.0.0.1:8234",
            "channels": { "input1": { "physical": 9 } }
        });
        let err = serde_json::from_value::<AssignmentTable>(json).unwrap_err();
        assert!(err.to_string().contains("physical channel 9"), "{err}");

        let json = serde_json::json!({ "channels": { "output2": { "physical": 0 } } });
        assert!(serde_json::from_value::<AssignmentTable>(json).is_err());
    }

    #[test]
    fn test_deserialize_prunes_empty_entries() {
        let json = serde_json::json!({
            "default_address": "10.0.0.1",
            "channels": { "input3": {}, "output1": { "physical": 2 } }
        });
        let table: AssignmentTable = serde_json::from_value(json).unwrap();
        assert_eq!(table.overrides().count(), 1);
        assert_eq!(table.physical_of(DisplayChannel::output(1)), 2);
        assert!(table.validate().is_ok());
    }
}
