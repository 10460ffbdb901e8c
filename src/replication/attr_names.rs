//! Attribute names the replication core reads or writes itself.

pub const OBJECT_CLASS: &str = "objectClass";
pub const CN: &str = "cn";

/// Immutable per-object identifier. Never replaced or deleted by replication.
pub const OBJECT_GUID: &str = "objectGUID";

pub const IS_DELETED: &str = "isDeleted";
pub const IS_DELETED_TRUE: &str = "TRUE";
pub const LAST_KNOWN_DN: &str = "lastKnownDN";

pub const USN_CREATED: &str = "uSNCreated";
pub const USN_CHANGED: &str = "uSNChanged";

pub const VALUE_META_DATA: &str = "valueMetaData";

/// Root-level container tombstones are moved under.
pub const DELETED_OBJECTS_DN: &str = "cn=Deleted Objects";

/// Attributes stamped locally on every apply. Supplied values and metadata for these are ignored.
pub fn is_locally_maintained(name: &str) -> bool {
    name.eq_ignore_ascii_case(USN_CREATED)
        || name.eq_ignore_ascii_case(USN_CHANGED)
        || name.eq_ignore_ascii_case(VALUE_META_DATA)
}
