use crate::backend::{Attribute, DirectoryEntry, Dn};
use crate::grpc::{ProtoAttribute, ProtoChangeRecord, ProtoDirectoryEntry};
use crate::replication::{AttributeMetadata, MetadataParseError, ValueMetadata};
use bytes::Bytes;
use prost::Message;
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Modify,
    Delete,
}

/// One inbound change, as handed to the applier.
///
/// `entry` carries the values of the attributes that changed. An attribute named in
/// `attribute_metadata` but absent from `entry` had all of its values removed on the supplier.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicationUpdate {
    pub entry: DirectoryEntry,
    pub attribute_metadata: BTreeMap<String, AttributeMetadata>,
    pub value_metadata: Vec<ValueMetadata>,
    pub partner_id: String,
    pub partner_usn: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ChangeRecordError {
    #[error("change record is not a valid protobuf message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("change record has no entry")]
    MissingEntry,
    #[error("metadata of attribute {attr} is malformed: {source}")]
    AttributeMetadata {
        attr: String,
        #[source]
        source: MetadataParseError,
    },
    #[error("value metadata is malformed: {0}")]
    ValueMetadata(#[source] MetadataParseError),
}

impl ReplicationUpdate {
    pub fn new(entry: DirectoryEntry, partner_id: impl Into<String>) -> Self {
        ReplicationUpdate {
            entry,
            attribute_metadata: BTreeMap::new(),
            value_metadata: Vec::new(),
            partner_id: partner_id.into(),
            partner_usn: 0,
        }
    }

    pub fn metadata_for(&self, attr_name: &str) -> Option<&AttributeMetadata> {
        self.attribute_metadata
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attr_name))
            .map(|(_, metadata)| metadata)
    }

    pub fn encode(&self) -> Bytes {
        let record = ProtoChangeRecord {
            partner_id: self.partner_id.clone(),
            partner_usn: self.partner_usn,
            entry: Some(ProtoDirectoryEntry {
                dn: self.entry.dn.as_str().to_string(),
                attributes: self
                    .entry
                    .attributes
                    .iter()
                    .map(|attr| ProtoAttribute {
                        name: attr.name.clone(),
                        values: attr.values.iter().map(|v| v.to_vec()).collect(),
                    })
                    .collect(),
            }),
            attribute_metadata: self
                .attribute_metadata
                .iter()
                .map(|(name, metadata)| (name.clone(), metadata.to_string()))
                .collect(),
            value_metadata: self.value_metadata.iter().map(|vm| vm.to_bytes().to_vec()).collect(),
        };

        let mut buf = Vec::with_capacity(record.encoded_len());
        record
            .encode(&mut buf)
            .expect("Encoding into a Vec<u8> can't run out of space");
        Bytes::from(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChangeRecordError> {
        let record = ProtoChangeRecord::decode(bytes)?;
        let proto_entry = record.entry.ok_or(ChangeRecordError::MissingEntry)?;

        let entry = DirectoryEntry::new(
            Dn::new(proto_entry.dn),
            proto_entry
                .attributes
                .into_iter()
                .map(|attr| Attribute::new(attr.name, attr.values.into_iter().map(Bytes::from).collect()))
                .collect(),
        );

        let mut attribute_metadata = BTreeMap::new();
        for (attr, metadata) in record.attribute_metadata {
            match AttributeMetadata::from_str(&metadata) {
                Ok(parsed) => {
                    attribute_metadata.insert(attr, parsed);
                }
                Err(source) => return Err(ChangeRecordError::AttributeMetadata { attr, source }),
            }
        }

        let value_metadata = record
            .value_metadata
            .iter()
            .map(|raw| ValueMetadata::from_bytes(raw))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ChangeRecordError::ValueMetadata)?;

        Ok(ReplicationUpdate {
            entry,
            attribute_metadata,
            value_metadata,
            partner_id: record.partner_id,
            partner_usn: record.partner_usn,
        })
    }
}
