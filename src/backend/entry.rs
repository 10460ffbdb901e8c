use crate::replication::AttributeMetadata;
use bytes::Bytes;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Reserved high bit of an [EntryId]. Log entries are stored as ordinary objects, and this bit keeps
/// their identifiers out of the range handed out to directory objects.
pub const LOG_ENTRY_EID_PREFIX: u64 = 1 << 62;

/// EntryId identifies a persisted record in the object store.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct EntryId(u64);

impl EntryId {
    /// Placeholder for entries that have not been added yet. The store assigns the real id.
    pub const UNASSIGNED: EntryId = EntryId(0);

    pub fn new(id: u64) -> Self {
        EntryId(id)
    }

    pub fn for_log_index(index: u64) -> Self {
        EntryId(LOG_ENTRY_EID_PREFIX | index)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_log_entry(&self) -> bool {
        self.0 & LOG_ENTRY_EID_PREFIX != 0
    }

    pub fn is_unassigned(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_log_entry() {
            write!(f, "log:{}", self.0 & !LOG_ENTRY_EID_PREFIX)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Distinguished name of a directory object, e.g. `cn=alice,ou=people,dc=example`.
///
/// Equality and hashing are case-insensitive and ignore whitespace around separators. RDN values
/// containing escaped commas are not supported.
#[derive(Clone)]
pub struct Dn(String);

impl Dn {
    pub fn new<S: Into<String>>(dn: S) -> Self {
        Dn(dn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn normalized(&self) -> String {
        self.0
            .split(',')
            .map(|rdn| match rdn.find('=') {
                Some(eq) => format!(
                    "{}={}",
                    rdn[..eq].trim().to_ascii_lowercase(),
                    rdn[eq + 1..].trim().to_ascii_lowercase()
                ),
                None => rdn.trim().to_ascii_lowercase(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// None for a root level name.
    pub fn parent(&self) -> Option<Dn> {
        self.0.find(',').map(|comma| Dn(self.0[comma + 1..].trim().to_string()))
    }

    pub fn rdn(&self) -> &str {
        match self.0.find(',') {
            Some(comma) => self.0[..comma].trim(),
            None => self.0.trim(),
        }
    }

    pub fn child(&self, rdn: &str) -> Dn {
        Dn(format!("{},{}", rdn, self.0))
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state)
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One attribute of a directory object. An attribute with metadata but no values is a deleted
/// attribute whose version vector is still retained.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Bytes>,
    pub metadata: Option<AttributeMetadata>,
}

impl Attribute {
    pub fn new<S: Into<String>>(name: S, values: Vec<Bytes>) -> Self {
        Attribute {
            name: name.into(),
            values,
            metadata: None,
        }
    }

    pub fn single<S: Into<String>, V: Into<Bytes>>(name: S, value: V) -> Self {
        Self::new(name, vec![value.into()])
    }

    pub fn with_metadata(mut self, metadata: AttributeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn has_value(&self, value: &[u8]) -> bool {
        self.values.iter().any(|v| v.as_ref() == value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryEntry {
    pub id: EntryId,
    pub dn: Dn,
    pub attributes: Vec<Attribute>,
}

impl DirectoryEntry {
    pub fn new(dn: Dn, attributes: Vec<Attribute>) -> Self {
        DirectoryEntry {
            id: EntryId::UNASSIGNED,
            dn,
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.is_named(name))
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.is_named(name))
    }

    pub fn first_value(&self, name: &str) -> Option<&Bytes> {
        self.attribute(name).and_then(|a| a.values.first())
    }

    pub fn first_value_str(&self, name: &str) -> Option<&str> {
        self.first_value(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Apply a single modification in place. Missing values on delete and duplicate values on add
    /// are ignored; replication may deliver a change the entry already reflects.
    pub fn apply(&mut self, modification: &Modification) {
        let incoming = &modification.attribute;
        match modification.op {
            ModOp::Add => {
                let attr = self.attribute_or_insert(&incoming.name);
                for value in incoming.values.iter() {
                    if !attr.has_value(value) {
                        attr.values.push(value.clone());
                    }
                }
                if incoming.metadata.is_some() {
                    attr.metadata = incoming.metadata.clone();
                }
            }
            ModOp::Replace => {
                if incoming.values.is_empty() && incoming.metadata.is_none() {
                    self.attributes.retain(|a| !a.is_named(&incoming.name));
                } else {
                    let attr = self.attribute_or_insert(&incoming.name);
                    attr.values = incoming.values.clone();
                    if incoming.metadata.is_some() {
                        attr.metadata = incoming.metadata.clone();
                    }
                }
            }
            ModOp::Delete => {
                if incoming.values.is_empty() {
                    match &incoming.metadata {
                        Some(metadata) => {
                            let attr = self.attribute_or_insert(&incoming.name);
                            attr.values.clear();
                            attr.metadata = Some(metadata.clone());
                        }
                        None => self.attributes.retain(|a| !a.is_named(&incoming.name)),
                    }
                } else if let Some(attr) = self.attribute_mut(&incoming.name) {
                    attr.values.retain(|v| !incoming.has_value(v));
                    if incoming.metadata.is_some() {
                        attr.metadata = incoming.metadata.clone();
                    }
                }
            }
        }
    }

    fn attribute_or_insert(&mut self, name: &str) -> &mut Attribute {
        let position = match self.attributes.iter().position(|a| a.is_named(name)) {
            Some(position) => position,
            None => {
                self.attributes.push(Attribute::new(name, Vec::new()));
                self.attributes.len() - 1
            }
        };
        &mut self.attributes[position]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Replace,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Modification {
    pub op: ModOp,
    pub attribute: Attribute,
}

impl Modification {
    pub fn add(attribute: Attribute) -> Self {
        Modification {
            op: ModOp::Add,
            attribute,
        }
    }

    pub fn replace(attribute: Attribute) -> Self {
        Modification {
            op: ModOp::Replace,
            attribute,
        }
    }

    pub fn delete(attribute: Attribute) -> Self {
        Modification {
            op: ModOp::Delete,
            attribute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Usn;

    fn md(version: u64) -> AttributeMetadata {
        AttributeMetadata {
            local_usn: Usn::new(5),
            version,
            originating_server_id: "dc-1".into(),
            originating_time: "20210101000000.000".into(),
            originating_usn: Usn::new(5),
        }
    }

    #[test]
    fn log_entry_ids_do_not_collide_with_object_ids() {
        let log_id = EntryId::for_log_index(7);
        assert!(log_id.is_log_entry());
        assert_ne!(log_id, EntryId::new(7));
        assert!(!EntryId::new(7).is_log_entry());
        assert_eq!(format!("{:?}", log_id), "log:7");
    }

    #[test]
    fn dn_compare_and_parent() {
        let dn = Dn::new("CN=Alice, ou=People,dc=Example");
        assert_eq!(dn, Dn::new("cn=alice,ou=people,dc=example"));
        assert_eq!(dn.parent(), Some(Dn::new("ou=people,dc=example")));
        assert_eq!(Dn::new("dc=example").parent(), None);
        assert_eq!(Dn::new("dc=example").child("ou=x"), Dn::new("ou=x,dc=example"));
    }

    #[test]
    fn delete_without_values_keeps_metadata_as_tombstone_attribute() {
        let mut entry = DirectoryEntry::new(
            Dn::new("cn=a"),
            vec![Attribute::single("description", "hi").with_metadata(md(1))],
        );

        entry.apply(&Modification::delete(
            Attribute::new("description", vec![]).with_metadata(md(2)),
        ));

        let attr = entry.attribute("description").unwrap();
        assert!(attr.values.is_empty());
        assert_eq!(attr.metadata, Some(md(2)));

        entry.apply(&Modification::delete(Attribute::new("description", vec![])));
        assert!(entry.attribute("description").is_none());
    }

    #[test]
    fn value_level_add_and_delete() {
        let mut entry = DirectoryEntry::new(Dn::new("cn=g"), vec![Attribute::single("member", "cn=x")]);

        entry.apply(&Modification::add(Attribute::new(
            "Member",
            vec![Bytes::from("cn=x"), Bytes::from("cn=y")],
        )));
        assert_eq!(
            entry.attribute("member").unwrap().values,
            vec![Bytes::from("cn=x"), Bytes::from("cn=y")]
        );

        entry.apply(&Modification::delete(Attribute::single("member", "cn=x")));
        entry.apply(&Modification::delete(Attribute::single("member", "cn=missing")));
        assert_eq!(entry.attribute("member").unwrap().values, vec![Bytes::from("cn=y")]);
    }

    #[test]
    fn replace_sets_values_and_metadata() {
        let mut entry = DirectoryEntry::new(Dn::new("cn=a"), vec![]);
        entry.apply(&Modification::replace(
            Attribute::single("sn", "smith").with_metadata(md(3)),
        ));
        assert_eq!(entry.first_value_str("SN"), Some("smith"));
        assert_eq!(entry.attribute("sn").unwrap().metadata, Some(md(3)));
    }
}
