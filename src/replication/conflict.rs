use crate::backend::{Attribute, DirectoryEntry, Modification};
use crate::replication::attr_names::{self, OBJECT_GUID, VALUE_META_DATA};
use crate::replication::{AttributeMetadata, ReplicationUpdate, Usn, ValueMetadata, ValueOp};
use bytes::Bytes;
use std::cmp::Ordering;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Winner {
    Supplier,
    Consumer,
}

/// Decide between a supplier's and a consumer's version of the same attribute (or value).
///
/// A higher version wins. On a tied version the lexicographically larger originating server id
/// wins, so every replica picks the same winner independently. Identical tuples go to the
/// supplier, which makes re-applying a change idempotent.
pub fn resolve(supplier: &AttributeMetadata, consumer: &AttributeMetadata) -> Winner {
    match supplier.version.cmp(&consumer.version) {
        Ordering::Greater => Winner::Supplier,
        Ordering::Less => Winner::Consumer,
        Ordering::Equal => {
            if supplier.originating_server_id < consumer.originating_server_id {
                Winner::Consumer
            } else {
                Winner::Supplier
            }
        }
    }
}

/// ConflictResolver turns an inbound update into the modifications that should be applied to the
/// local copy of the object. Modifications for attributes (or values) where the local version wins
/// are left out.
pub struct ConflictResolver {
    logger: slog::Logger,
}

impl ConflictResolver {
    pub fn new(logger: slog::Logger) -> Self {
        ConflictResolver { logger }
    }

    /// One replace (values supplied) or delete (metadata only) per winning attribute. The local
    /// USN is stamped into each winner's metadata.
    pub fn resolve_attributes(&self, update: &ReplicationUpdate, local: &DirectoryEntry, usn: Usn) -> Vec<Modification> {
        let mut mods = Vec::new();

        for (name, supplied) in update.attribute_metadata.iter() {
            if name.eq_ignore_ascii_case(OBJECT_GUID) || attr_names::is_locally_maintained(name) {
                continue;
            }

            if let Some(current) = local.attribute(name).and_then(|a| a.metadata.as_ref()) {
                match resolve(supplied, current) {
                    Winner::Consumer => {
                        slog::warn!(
                            self.logger,
                            "Possible conflict, supplier loses. dn: {}, attr: {}, supplier meta: {}, consumer meta: {}",
                            local.dn,
                            name,
                            supplied,
                            current
                        );
                        continue;
                    }
                    Winner::Supplier if supplied.version == current.version => {
                        slog::warn!(
                            self.logger,
                            "Possible conflict, supplier server id wins. dn: {}, attr: {}, supplier meta: {}, consumer meta: {}",
                            local.dn,
                            name,
                            supplied,
                            current
                        );
                    }
                    Winner::Supplier => {}
                }
            }

            let metadata = supplied.clone().stamped(usn);
            let values = update
                .entry
                .attribute(name)
                .map(|a| a.values.clone())
                .unwrap_or_default();
            if values.is_empty() {
                mods.push(Modification::delete(Attribute::new(name.as_str(), values).with_metadata(metadata)));
            } else {
                mods.push(Modification::replace(Attribute::new(name.as_str(), values).with_metadata(metadata)));
            }
        }

        mods
    }

    /// Per-value changes of multi-valued attributes. Each winning value yields the value change plus
    /// an upsert of its entry in `valueMetaData`.
    pub fn resolve_values(&self, update: &ReplicationUpdate, local: &DirectoryEntry, usn: Usn) -> Vec<Modification> {
        // Tracks what valueMetaData will hold once `mods` are applied, so a value supplied twice in
        // one update keeps a single record.
        let mut local_values = self.local_value_metadata(local);
        let mut mods = Vec::new();

        for supplied in update.value_metadata.iter() {
            let position = local_values
                .iter()
                .position(|(_, vm)| vm.is_for(&supplied.attr_name, &supplied.value));

            if let Some(position) = position {
                let current = &local_values[position].1;
                if resolve(&supplied.metadata, &current.metadata) == Winner::Consumer {
                    slog::warn!(
                        self.logger,
                        "Possible value conflict, supplier loses. dn: {}, attr: {}, supplier meta: {}, consumer meta: {}",
                        local.dn,
                        supplied.attr_name,
                        supplied.metadata,
                        current.metadata
                    );
                    continue;
                }
            }

            let change = Attribute::new(supplied.attr_name.as_str(), vec![supplied.value.clone()]);
            mods.push(match supplied.op {
                ValueOp::Add => Modification::add(change),
                ValueOp::Delete => Modification::delete(change),
            });

            let stamped = ValueMetadata {
                metadata: supplied.metadata.clone().stamped(usn),
                ..supplied.clone()
            };
            let stamped_raw = stamped.to_bytes();
            match position {
                Some(position) => {
                    let (raw, _) = std::mem::replace(&mut local_values[position], (stamped_raw.clone(), stamped));
                    mods.push(Modification::delete(Attribute::new(VALUE_META_DATA, vec![raw])));
                }
                None => local_values.push((stamped_raw.clone(), stamped)),
            }
            mods.push(Modification::add(Attribute::new(VALUE_META_DATA, vec![stamped_raw])));
        }

        mods
    }

    fn local_value_metadata(&self, local: &DirectoryEntry) -> Vec<(Bytes, ValueMetadata)> {
        let values = match local.attribute(VALUE_META_DATA) {
            Some(attr) => &attr.values,
            None => return Vec::new(),
        };

        values
            .iter()
            .filter_map(|raw| match ValueMetadata::from_bytes(raw) {
                Ok(vm) => Some((raw.clone(), vm)),
                Err(e) => {
                    slog::warn!(self.logger, "Ignoring malformed value metadata on {}: {}", local.dn, e);
                    None
                }
            })
            .collect()
    }
}
