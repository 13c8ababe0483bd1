use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Placeholder shown for peripherals that do not advertise a local name.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Stable, platform-assigned identifier of a physical peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralIdentity(Arc<str>);

impl PeripheralIdentity {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A single advertisement received while scanning.
///
/// Two advertisements are equal when they come from the same peripheral,
/// whatever their name or signal strength.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub identity: PeripheralIdentity,
    /// Local name from the advertising data, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
}

impl Advertisement {
    pub fn new(identity: PeripheralIdentity, name: Option<String>, rssi: i16) -> Self {
        Self {
            identity,
            name,
            rssi,
        }
    }

    /// Advertised name, or [`UNKNOWN_DEVICE_NAME`] when the peripheral did not send one.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

impl PartialEq for Advertisement {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Advertisement {}

impl PartialEq<PeripheralIdentity> for Advertisement {
    fn eq(&self, other: &PeripheralIdentity) -> bool {
        &self.identity == other
    }
}

impl PartialEq<Advertisement> for PeripheralIdentity {
    fn eq(&self, other: &Advertisement) -> bool {
        self == &other.identity
    }
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// First advertisement seen from a peripheral during the scan.
    Discovered(Advertisement),
    /// Refreshed name or signal strength of an already discovered peripheral.
    Updated(Advertisement),
}

/// Structural change to a [`DeviceList`] caused by one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceListChange {
    Inserted(usize),
    Updated(usize),
}

struct Entry {
    advertisement: Advertisement,
    last_refresh: Instant,
}

/// Ordered set of discovered peripherals, one entry per identity.
///
/// Each advertisement updates its entry in place. Refresh notifications for an
/// existing entry are limited to one per `refresh_interval`; the stored data is
/// always the latest regardless.
pub struct DeviceList {
    entries: Vec<Entry>,
    refresh_interval: Duration,
}

impl Default for DeviceList {
    fn default() -> Self {
        DeviceList::new(Duration::from_secs(1))
    }
}

impl DeviceList {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            entries: Vec::new(),
            refresh_interval,
        }
    }

    /// Merges an advertisement received now.
    pub fn apply(&mut self, advertisement: Advertisement) -> Option<DeviceListChange> {
        self.apply_at(advertisement, Instant::now())
    }

    /// Merges an advertisement received at `now`.
    pub fn apply_at(
        &mut self,
        advertisement: Advertisement,
        now: Instant,
    ) -> Option<DeviceListChange> {
        match self.position(&advertisement.identity) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.advertisement.rssi = advertisement.rssi;
                // Scan responses without a local name keep the known one.
                if advertisement.name.is_some() {
                    entry.advertisement.name = advertisement.name;
                }

                if now.saturating_duration_since(entry.last_refresh) >= self.refresh_interval {
                    entry.last_refresh = now;
                    Some(DeviceListChange::Updated(index))
                } else {
                    None
                }
            }
            None => {
                self.entries.push(Entry {
                    advertisement,
                    last_refresh: now,
                });
                Some(DeviceListChange::Inserted(self.entries.len() - 1))
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&Advertisement> {
        self.entries.get(index).map(|entry| &entry.advertisement)
    }

    pub fn find(&self, identity: &PeripheralIdentity) -> Option<&Advertisement> {
        self.position(identity).and_then(|index| self.get(index))
    }

    pub fn position(&self, identity: &PeripheralIdentity) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.advertisement.identity == identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Advertisement> {
        self.entries.iter().map(|entry| &entry.advertisement)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
