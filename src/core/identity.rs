//! Device identity resolution
//!
//! Every device prints its hardware serial during boot. The identity table maps
//! that serial to a small logical ID, so a device keeps its role across
//! reconnects no matter which port it lands on.

use super::error::AcquisitionError;
use super::logger::EventLog;
use super::protocol::{classify, DeviceLine};
use super::transport::{DeviceLink, LinkError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Logical ID of a device whose hardware ID is not in the table
pub const UNKNOWN_LOGICAL_ID: i32 = -1;

/// Hardware serial ID → logical device ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityTable {
    ids: BTreeMap<String, i32>,
}

impl IdentityTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table from `(hardware_id, logical_id)` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        Self {
            ids: pairs.into_iter().map(|(hw, id)| (hw.into(), id)).collect(),
        }
    }

    /// Add or replace a mapping
    pub fn insert(&mut self, hardware_id: impl Into<String>, logical_id: i32) {
        self.ids.insert(hardware_id.into(), logical_id);
    }

    /// Logical ID for a hardware ID, [`UNKNOWN_LOGICAL_ID`] if absent
    pub fn lookup(&self, hardware_id: &str) -> i32 {
        self.ids.get(hardware_id).copied().unwrap_or(UNKNOWN_LOGICAL_ID)
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate over mappings in hardware-ID order
    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.ids.iter().map(|(hw, id)| (hw.as_str(), *id))
    }

    /// Logical IDs that more than one hardware ID maps to
    pub fn duplicate_logical_ids(&self) -> Vec<(i32, Vec<String>)> {
        let mut by_logical: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for (hw, id) in &self.ids {
            by_logical.entry(*id).or_default().push(hw.clone());
        }
        by_logical.into_iter().filter(|(_, hws)| hws.len() > 1).collect()
    }
}

/// Result of a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Serial reported by the device
    pub hardware_id: String,
    /// Logical ID from the table, or [`UNKNOWN_LOGICAL_ID`]
    pub logical_id: i32,
}

impl Identity {
    /// True if the table knew the hardware ID
    pub fn is_known(&self) -> bool {
        self.logical_id != UNKNOWN_LOGICAL_ID
    }
}

/// Runs the boot handshake and maps the reported serial
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    table: IdentityTable,
    handshake_timeout: Duration,
    read_timeout: Duration,
    log: EventLog,
}

impl IdentityResolver {
    /// Create a resolver
    pub fn new(table: IdentityTable, handshake_timeout: Duration, read_timeout: Duration, log: EventLog) -> Self {
        Self {
            table,
            handshake_timeout,
            read_timeout,
            log,
        }
    }

    /// Identity table in use
    pub fn table(&self) -> &IdentityTable {
        &self.table
    }

    /// Read boot output until the ready marker, returning the hardware ID.
    ///
    /// Stale input is discarded once the device is ready.
    pub async fn handshake(&self, link: &mut dyn DeviceLink) -> Result<String, LinkError> {
        self.handshake_unless(link, &|| false)
            .await?
            .ok_or_else(|| LinkError::ConnectionFailed(format!("handshake with {} abandoned", link.describe())))
    }

    /// [`handshake`](Self::handshake) that gives up once `cancelled` returns
    /// true, checked before every read. Returns `None` in that case.
    pub async fn handshake_unless(
        &self,
        link: &mut dyn DeviceLink,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<Option<String>, LinkError> {
        let deadline = Instant::now() + self.handshake_timeout;
        let mut hardware_id = None;

        loop {
            if cancelled() {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::Timeout(self.handshake_timeout));
            }

            let Some(line) = link.read_line(remaining.min(self.read_timeout)).await? else {
                continue;
            };
            if !line.trim().is_empty() {
                self.log.debug(format!("boot output: {}", line.trim()));
            }

            match classify(&line, usize::MAX) {
                DeviceLine::HardwareId(id) => hardware_id = Some(id),
                DeviceLine::Ready => break,
                _ => {}
            }
        }

        link.clear_input().await?;

        hardware_id.map(Some).ok_or_else(|| {
            LinkError::ConnectionFailed(format!("{} became ready without reporting a hardware ID", link.describe()))
        })
    }

    /// Handshake and look the hardware ID up in the table
    pub async fn resolve(&self, link: &mut dyn DeviceLink) -> Result<Identity, LinkError> {
        let hardware_id = self.handshake(link).await?;
        let logical_id = self.table.lookup(&hardware_id);
        Ok(Identity { hardware_id, logical_id })
    }
}

/// Logical IDs claimed so far during one initialization
#[derive(Debug, Default)]
pub struct IdentityClaims {
    claims: HashMap<i32, String>,
}

impl IdentityClaims {
    /// Claim `identity.logical_id` for one port.
    ///
    /// Fails if the logical ID is already held, whether by another hardware
    /// ID or by a second board reporting the same one.
    pub fn claim(&mut self, identity: &Identity) -> Result<(), AcquisitionError> {
        if let Some(holder) = self.claims.get(&identity.logical_id) {
            return Err(AcquisitionError::IdentityCollision {
                logical_id: identity.logical_id,
                first: holder.clone(),
                second: identity.hardware_id.clone(),
            });
        }
        self.claims.insert(identity.logical_id, identity.hardware_id.clone());
        Ok(())
    }

    /// Number of claimed logical IDs
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// True if nothing was claimed
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulator::VirtualDevice;

    fn resolver(table: IdentityTable) -> IdentityResolver {
        IdentityResolver::new(table, Duration::from_secs(2), Duration::from_millis(50), EventLog::default())
    }

    #[test]
    fn test_lookup_unknown_is_sentinel() {
        let table = IdentityTable::from_pairs([("AAA", 0), ("BBB", 1)]);
        assert_eq!(table.lookup("BBB"), 1);
        assert_eq!(table.lookup("CCC"), UNKNOWN_LOGICAL_ID);
    }

    #[test]
    fn test_duplicate_logical_ids() {
        let table = IdentityTable::from_pairs([("AAA", 0), ("BBB", 0), ("CCC", 1)]);
        let dupes = table.duplicate_logical_ids();
        assert_eq!(dupes, vec![(0, vec!["AAA".to_string(), "BBB".to_string()])]);
    }

    #[test]
    fn test_claims_detect_collision() {
        let mut claims = IdentityClaims::default();
        let a = Identity { hardware_id: "AAA".into(), logical_id: 0 };
        let b = Identity { hardware_id: "BBB".into(), logical_id: 0 };
        claims.claim(&a).unwrap();
        assert!(matches!(claims.claim(&b), Err(AcquisitionError::IdentityCollision { logical_id: 0, .. })));
        assert!(claims.claim(&a).is_err());
        assert_eq!(claims.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_known_device() {
        let device = VirtualDevice::new("AAA");
        let mut link = device.link();
        let identity = resolver(IdentityTable::from_pairs([("AAA", 4)])).resolve(&mut link).await.unwrap();
        assert_eq!(identity, Identity { hardware_id: "AAA".into(), logical_id: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_unknown_device() {
        let device = VirtualDevice::new("ZZZ");
        let mut link = device.link();
        let identity = resolver(IdentityTable::from_pairs([("AAA", 4)])).resolve(&mut link).await.unwrap();
        assert!(!identity.is_known());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out_without_ready() {
        let device = VirtualDevice::new("AAA").with_boot_lines(vec!["HW_ID: AAA".to_string()]);
        let mut link = device.link();
        let err = resolver(IdentityTable::new()).handshake(&mut link).await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_gives_up_when_cancelled() {
        let device = VirtualDevice::new("AAA").with_boot_lines(vec!["Initializing sensors".to_string()]);
        let mut link = device.link();
        let begin = Instant::now();
        let cancel_at = begin + Duration::from_millis(200);

        let result = resolver(IdentityTable::new())
            .handshake_unless(&mut link, &move || Instant::now() >= cancel_at)
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(begin.elapsed() < Duration::from_millis(300));
    }
}
