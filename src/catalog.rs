//! The DID catalog: descriptors, the writable set, and versioned merge.
//!
//! Reading the on-disk dictionary files is the host's job (`SPEC_FULL.md`
//! §1); this module only merges already-parsed [`DidDescriptor`] lists into
//! a [`DidCatalog`] and decides, given an old and a new catalog version,
//! what a catalog upgrade needs to do to already-published state
//! (`SPEC_FULL.md` §4.4).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;

/// Describes how to decode/encode one DID's raw payload.
///
/// Loaded at startup, mutated only by a catalog-update or scan operation
/// (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidDescriptor {
    /// The 16-bit data identifier.
    pub did: u16,
    /// Human-readable id this DID publishes under (before sanitizing).
    pub symbolic_id: String,
    /// Expected raw payload length in bytes. A read whose actual length
    /// doesn't match this is treated as device-specific (raw-hex only).
    pub declared_len: u16,
    /// Name of the codec in [`CodecKind`]'s registry.
    pub codec_name: String,
    /// Codec-specific configuration (e.g. a bitfield's named bit indices).
    #[serde(default)]
    pub codec_args: std::collections::BTreeMap<String, serde_json::Value>,
}

/// A catalog version string, compared numerically component-by-component
/// (`"1.10" > "1.2"`, not lexicographically).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogVersion(String);

impl CatalogVersion {
    /// Wraps a version string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    fn parts(&self) -> Vec<u64> {
        self.0.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    }
}

impl std::fmt::Display for CatalogVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for CatalogVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CatalogVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let a = self.parts();
        let b = other.parts();
        let len = a.len().max(b.len());
        for i in 0..len {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            match x.cmp(&y) {
                std::cmp::Ordering::Equal => continue,
                ord => return ord,
            }
        }
        std::cmp::Ordering::Equal
    }
}

/// Error produced while merging or validating a catalog.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    /// The same DID appeared twice within one source list (common or
    /// device-specific) — ambiguous, and therefore rejected rather than
    /// silently taking "the last one wins".
    #[error("duplicate DID 0x{0:04X} within one catalog source")]
    DuplicateDid(u16),
    /// A descriptor named a codec this build doesn't know. Per the codec
    /// dispatch design note, this is caught here, at merge time, not on the
    /// first read of that DID.
    #[error("DID 0x{did:04X} references an unknown codec")]
    BadCodec {
        /// The offending DID.
        did: u16,
        /// The underlying codec lookup failure.
        #[source]
        source: crate::codec::CodecError,
    },
}

/// The merged, queryable DID catalog for one device.
#[derive(Debug, Clone)]
pub struct DidCatalog {
    version: CatalogVersion,
    descriptors: HashMap<u16, DidDescriptor>,
    writable: HashSet<u16>,
    /// Below this version, a catalog with no structural change still needs
    /// its tree leaves republished to fix element types (`SPEC_FULL.md`
    /// §4.4). Defaults to `"0.0"`, i.e. no catalog is ever below threshold,
    /// for catalogs built without [`DidCatalog::with_upgrade_policy`].
    type_correction_threshold: CatalogVersion,
    /// DIDs to pre-delete ahead of a type-correction republish, so a
    /// variable-length DID's old value can't conflict with the corrected
    /// type.
    variable_length_dids: HashSet<u16>,
}

impl DidCatalog {
    /// Merges a common catalog with a device-specific overlay.
    ///
    /// Entries in `device_specific` override entries in `common` with the
    /// same DID (a device overlay is expected to narrow or correct the
    /// common catalog, so this is not an error). A duplicate DID *within*
    /// either list on its own is rejected, and every codec name is
    /// validated against [`CodecKind`] up front.
    pub fn merge(
        version: CatalogVersion,
        common: Vec<DidDescriptor>,
        device_specific: Vec<DidDescriptor>,
        writable: HashSet<u16>,
    ) -> Result<Self, CatalogError> {
        let mut descriptors = HashMap::with_capacity(common.len() + device_specific.len());
        insert_checked(&mut descriptors, common, true)?;
        insert_checked(&mut descriptors, device_specific, false)?;
        Ok(Self {
            version,
            descriptors,
            writable,
            type_correction_threshold: CatalogVersion::new("0.0"),
            variable_length_dids: HashSet::new(),
        })
    }

    /// Attaches the upgrade policy this catalog ships as the "shipped" side
    /// of a [`plan_upgrade`] call: the version below which a structurally
    /// unchanged catalog still needs its tree leaves retyped, and the fixed
    /// list of variable-length DIDs to pre-delete when that happens.
    pub fn with_upgrade_policy(mut self, type_correction_threshold: CatalogVersion, variable_length_dids: HashSet<u16>) -> Self {
        self.type_correction_threshold = type_correction_threshold;
        self.variable_length_dids = variable_length_dids;
        self
    }

    /// Looks up a DID's descriptor.
    pub fn get(&self, did: u16) -> Option<&DidDescriptor> {
        self.descriptors.get(&did)
    }

    /// Returns true if `did` is authorized for write.
    pub fn is_writable(&self, did: u16) -> bool {
        self.writable.contains(&did)
    }

    /// This catalog's version.
    pub fn version(&self) -> &CatalogVersion {
        &self.version
    }

    /// Iterates all known DID descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &DidDescriptor> {
        self.descriptors.values()
    }
}

fn insert_checked(
    into: &mut HashMap<u16, DidDescriptor>,
    list: Vec<DidDescriptor>,
    reject_duplicates: bool,
) -> Result<(), CatalogError> {
    for d in list {
        CodecKind::parse(&d.codec_name).map_err(|source| CatalogError::BadCodec {
            did: d.did,
            source,
        })?;
        if reject_duplicates && into.contains_key(&d.did) {
            return Err(CatalogError::DuplicateDid(d.did));
        }
        into.insert(d.did, d);
    }
    Ok(())
}

/// What a catalog version bump requires of already-published state.
///
/// Computed by [`plan_upgrade`]; the decode sink is the thing that actually
/// deletes and republishes (`SPEC_FULL.md` §4.4).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogUpgrade {
    /// DIDs whose `(codecName, declaredLen)` pair changed between the
    /// stored and shipped catalogs. Their published tree must be deleted
    /// and republished from the stored raw bytes using the new codec.
    pub changed_dids: Vec<u16>,
    /// If true (and `changed_dids` is empty), the shipped catalog carries
    /// no structural change but the stored version predates the
    /// type-correction threshold: tree leaves must be republished to fix
    /// element types.
    pub retype_leaves: bool,
    /// DIDs to pre-delete before the retype pass, to avoid a
    /// variable-length DID's old value conflicting with the corrected type.
    /// Only populated when `retype_leaves` is true.
    pub pre_delete_variable_length: Vec<u16>,
}

impl CatalogUpgrade {
    /// True if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.changed_dids.is_empty() && !self.retype_leaves
    }
}

/// Decides what, if anything, upgrading from `stored` to `shipped` requires.
///
/// The upgrade policy (type-correction threshold, variable-length DID list)
/// is read from `shipped`, via [`DidCatalog::with_upgrade_policy`] — the
/// incoming catalog is what declares what the host should do on the way in.
///
/// Returns `None` if `stored` is already at or ahead of `shipped`'s version.
pub fn plan_upgrade(stored: &DidCatalog, shipped: &DidCatalog) -> Option<CatalogUpgrade> {
    if stored.version >= shipped.version {
        return None;
    }

    let mut changed: Vec<u16> = shipped
        .descriptors
        .iter()
        .filter_map(|(did, new_desc)| {
            let old_desc = stored.descriptors.get(did)?;
            let old_key = (&old_desc.codec_name, old_desc.declared_len);
            let new_key = (&new_desc.codec_name, new_desc.declared_len);
            (old_key != new_key).then_some(*did)
        })
        .collect();
    changed.sort_unstable();

    if !changed.is_empty() {
        return Some(CatalogUpgrade {
            changed_dids: changed,
            retype_leaves: false,
            pre_delete_variable_length: Vec::new(),
        });
    }

    if stored.version < shipped.type_correction_threshold {
        let mut pre_delete: Vec<u16> = shipped.variable_length_dids.iter().copied().collect();
        pre_delete.sort_unstable();
        return Some(CatalogUpgrade {
            changed_dids: Vec::new(),
            retype_leaves: true,
            pre_delete_variable_length: pre_delete,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn desc(did: u16, codec: &str, len: u16) -> DidDescriptor {
        DidDescriptor {
            did,
            symbolic_id: format!("did_{did:04X}"),
            declared_len: len,
            codec_name: codec.to_string(),
            codec_args: BTreeMap::new(),
        }
    }

    #[test]
    fn version_compares_numerically_not_lexically() {
        assert!(CatalogVersion::new("1.10") > CatalogVersion::new("1.2"));
        assert!(CatalogVersion::new("2.0") > CatalogVersion::new("1.99"));
        assert_eq!(CatalogVersion::new("1.0"), CatalogVersion::new("1.0"));
    }

    #[test]
    fn device_specific_overrides_common() {
        let common = vec![desc(0x100, "u8", 1)];
        let device = vec![desc(0x100, "u16-be", 2)];
        let cat = DidCatalog::merge(
            CatalogVersion::new("1.0"),
            common,
            device,
            HashSet::new(),
        )
        .unwrap();
        assert_eq!(cat.get(0x100).unwrap().codec_name, "u16-be");
    }

    #[test]
    fn duplicate_within_one_source_is_rejected() {
        let common = vec![desc(0x100, "u8", 1), desc(0x100, "u8", 1)];
        let err = DidCatalog::merge(CatalogVersion::new("1.0"), common, vec![], HashSet::new())
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateDid(0x100)));
    }

    #[test]
    fn unknown_codec_rejected_at_merge() {
        let common = vec![desc(0x100, "not-a-codec", 1)];
        let err = DidCatalog::merge(CatalogVersion::new("1.0"), common, vec![], HashSet::new())
            .unwrap_err();
        assert!(matches!(err, CatalogError::BadCodec { did: 0x100, .. }));
    }

    #[test]
    fn structural_change_triggers_republish_plan() {
        let stored = DidCatalog::merge(
            CatalogVersion::new("1.0"),
            vec![desc(0x100, "u8", 1)],
            vec![],
            HashSet::new(),
        )
        .unwrap();
        let shipped = DidCatalog::merge(
            CatalogVersion::new("1.1"),
            vec![desc(0x100, "u16-be", 2)],
            vec![],
            HashSet::new(),
        )
        .unwrap()
        .with_upgrade_policy(CatalogVersion::new("5.0"), HashSet::new());
        let plan = plan_upgrade(&stored, &shipped).unwrap();
        assert_eq!(plan.changed_dids, vec![0x100]);
        assert!(!plan.retype_leaves);
    }

    #[test]
    fn unchanged_but_stale_triggers_retype() {
        let stored = DidCatalog::merge(
            CatalogVersion::new("1.0"),
            vec![desc(0x100, "u8", 1)],
            vec![],
            HashSet::new(),
        )
        .unwrap();
        let shipped = DidCatalog::merge(
            CatalogVersion::new("1.1"),
            vec![desc(0x100, "u8", 1)],
            vec![],
            HashSet::new(),
        )
        .unwrap()
        .with_upgrade_policy(CatalogVersion::new("2.0"), HashSet::from([0x200]));
        let plan = plan_upgrade(&stored, &shipped).unwrap();
        assert!(plan.changed_dids.is_empty());
        assert!(plan.retype_leaves);
        assert_eq!(plan.pre_delete_variable_length, vec![0x200]);
    }

    #[test]
    fn already_current_needs_no_upgrade() {
        let stored = DidCatalog::merge(
            CatalogVersion::new("2.0"),
            vec![desc(0x100, "u8", 1)],
            vec![],
            HashSet::new(),
        )
        .unwrap();
        let shipped = DidCatalog::merge(
            CatalogVersion::new("1.0"),
            vec![desc(0x100, "u8", 1)],
            vec![],
            HashSet::new(),
        )
        .unwrap()
        .with_upgrade_policy(CatalogVersion::new("9.0"), HashSet::new());
        assert!(plan_upgrade(&stored, &shipped).is_none());
    }

    #[test]
    fn already_at_threshold_needs_no_retype() {
        let stored = DidCatalog::merge(
            CatalogVersion::new("2.0"),
            vec![desc(0x100, "u8", 1)],
            vec![],
            HashSet::new(),
        )
        .unwrap();
        let shipped = DidCatalog::merge(
            CatalogVersion::new("2.1"),
            vec![desc(0x100, "u8", 1)],
            vec![],
            HashSet::new(),
        )
        .unwrap()
        .with_upgrade_policy(CatalogVersion::new("2.0"), HashSet::new());
        assert!(plan_upgrade(&stored, &shipped).is_none());
    }
}
