use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use std::fmt;
use std::str::FromStr;

const ORIGINATING_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.3f";

/// Update sequence number. Monotonic per object store, stamped on every local write.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Default)]
pub struct Usn(u64);

impl Usn {
    pub fn new(usn: u64) -> Self {
        Usn(usn)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Usn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MetadataParseError {
    #[error("expected {expected} ':' separated fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("field '{field}' is not a valid integer: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("unknown value operation {0:?}")]
    InvalidValueOp(String),
    #[error("value length {declared} does not match remaining {remaining} bytes")]
    ValueLength { declared: usize, remaining: usize },
    #[error("metadata is not utf-8")]
    NotUtf8,
}

/// Version vector attached to every attribute of a directory object.
///
/// String form: `<localUSN>:<version>:<originatingServerId>:<originatingTime>:<originatingUSN>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeMetadata {
    pub local_usn: Usn,
    pub version: u64,
    pub originating_server_id: String,
    pub originating_time: String,
    pub originating_usn: Usn,
}

impl AttributeMetadata {
    /// Metadata for an attribute first written on this server.
    pub fn new_local(usn: Usn, invocation_id: &str) -> Self {
        AttributeMetadata {
            local_usn: usn,
            version: 1,
            originating_server_id: invocation_id.to_string(),
            originating_time: now_originating_time(),
            originating_usn: usn,
        }
    }

    /// Metadata for the next local change of an attribute that currently carries `self`. The
    /// originating USN is left unset and filled in when the change is applied.
    pub fn next_local_version(&self, invocation_id: &str) -> Self {
        AttributeMetadata {
            local_usn: Usn::default(),
            version: self.version + 1,
            originating_server_id: invocation_id.to_string(),
            originating_time: now_originating_time(),
            originating_usn: Usn::default(),
        }
    }

    /// Metadata for a brand new attribute originated locally but not yet applied.
    pub fn first_local_version(invocation_id: &str) -> Self {
        AttributeMetadata {
            local_usn: Usn::default(),
            version: 1,
            originating_server_id: invocation_id.to_string(),
            originating_time: now_originating_time(),
            originating_usn: Usn::default(),
        }
    }

    pub fn stamp_local_usn(&mut self, usn: Usn) {
        self.local_usn = usn;
        if self.originating_usn.is_unset() {
            self.originating_usn = usn;
        }
    }

    pub fn stamped(mut self, usn: Usn) -> Self {
        self.stamp_local_usn(usn);
        self
    }
}

impl fmt::Display for AttributeMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.local_usn.as_u64(),
            self.version,
            self.originating_server_id,
            self.originating_time,
            self.originating_usn.as_u64()
        )
    }
}

impl FromStr for AttributeMetadata {
    type Err = MetadataParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 5 {
            return Err(MetadataParseError::FieldCount {
                expected: 5,
                found: fields.len(),
            });
        }

        Ok(AttributeMetadata {
            local_usn: Usn::new(parse_u64("localUSN", fields[0])?),
            version: parse_u64("version", fields[1])?,
            originating_server_id: fields[2].to_string(),
            originating_time: fields[3].to_string(),
            originating_usn: Usn::new(parse_u64("originatingUSN", fields[4])?),
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueOp {
    Add,
    Delete,
}

impl ValueOp {
    fn code(&self) -> &'static str {
        match self {
            ValueOp::Add => "0",
            ValueOp::Delete => "1",
        }
    }

    fn from_code(code: &str) -> Result<Self, MetadataParseError> {
        match code {
            "0" => Ok(ValueOp::Add),
            "1" => Ok(ValueOp::Delete),
            other => Err(MetadataParseError::InvalidValueOp(other.to_string())),
        }
    }
}

/// Per-value version vector for one value of a multi-valued attribute.
///
/// Encoded form (values may be binary, so this is bytes rather than a string):
///
/// ```text
/// <attrName>:<localUSN>:<version>:<origServerId>:<origTime>:<origUSN>:<op>:<valueLen>:<value>
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueMetadata {
    pub attr_name: String,
    pub metadata: AttributeMetadata,
    pub op: ValueOp,
    pub value: Bytes,
}

const VALUE_METADATA_PREFIX_FIELDS: usize = 8;

impl ValueMetadata {
    pub fn to_bytes(&self) -> Bytes {
        let prefix = format!(
            "{}:{}:{}:{}:",
            self.attr_name,
            self.metadata,
            self.op.code(),
            self.value.len()
        );
        let mut buf = BytesMut::with_capacity(prefix.len() + self.value.len());
        buf.put_slice(prefix.as_bytes());
        buf.put_slice(&self.value);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetadataParseError> {
        // Everything up to the 8th ':' is text. The value after it is raw and may contain ':'.
        let mut fields = Vec::with_capacity(VALUE_METADATA_PREFIX_FIELDS);
        let mut start = 0;
        for (i, b) in bytes.iter().enumerate() {
            if *b == b':' {
                let field = std::str::from_utf8(&bytes[start..i]).map_err(|_| MetadataParseError::NotUtf8)?;
                fields.push(field);
                start = i + 1;
                if fields.len() == VALUE_METADATA_PREFIX_FIELDS {
                    break;
                }
            }
        }
        if fields.len() != VALUE_METADATA_PREFIX_FIELDS {
            return Err(MetadataParseError::FieldCount {
                expected: VALUE_METADATA_PREFIX_FIELDS + 1,
                found: fields.len(),
            });
        }

        let metadata = AttributeMetadata::from_str(&fields[1..6].join(":"))?;
        let op = ValueOp::from_code(fields[6])?;
        let declared = parse_u64("valueLen", fields[7])? as usize;
        let value = &bytes[start..];
        if value.len() != declared {
            return Err(MetadataParseError::ValueLength {
                declared,
                remaining: value.len(),
            });
        }

        Ok(ValueMetadata {
            attr_name: fields[0].to_string(),
            metadata,
            op,
            value: Bytes::copy_from_slice(value),
        })
    }

    pub fn is_for(&self, attr_name: &str, value: &[u8]) -> bool {
        self.attr_name.eq_ignore_ascii_case(attr_name) && self.value.as_ref() == value
    }
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, MetadataParseError> {
    value.parse::<u64>().map_err(|_| MetadataParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn now_originating_time() -> String {
    Utc::now().format(ORIGINATING_TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(version: u64, server: &str) -> AttributeMetadata {
        AttributeMetadata {
            local_usn: Usn::new(17),
            version,
            originating_server_id: server.to_string(),
            originating_time: "20210304050607.089".to_string(),
            originating_usn: Usn::new(12),
        }
    }

    #[test]
    fn attribute_metadata_string_form() {
        let md = metadata(3, "dc-1");
        assert_eq!(md.to_string(), "17:3:dc-1:20210304050607.089:12");
        assert_eq!(AttributeMetadata::from_str("17:3:dc-1:20210304050607.089:12"), Ok(md));
    }

    #[test]
    fn attribute_metadata_rejects_malformed() {
        assert_eq!(
            AttributeMetadata::from_str("1:2:3"),
            Err(MetadataParseError::FieldCount { expected: 5, found: 3 })
        );
        assert!(matches!(
            AttributeMetadata::from_str("x:2:dc:t:5"),
            Err(MetadataParseError::InvalidNumber { field: "localUSN", .. })
        ));
    }

    #[test]
    fn stamping_fills_unset_originating_usn_only() {
        let mut local = AttributeMetadata::first_local_version("dc-1");
        local.stamp_local_usn(Usn::new(40));
        assert_eq!(local.local_usn, Usn::new(40));
        assert_eq!(local.originating_usn, Usn::new(40));

        let remote = metadata(2, "dc-2").stamped(Usn::new(41));
        assert_eq!(remote.local_usn, Usn::new(41));
        assert_eq!(remote.originating_usn, Usn::new(12));
    }

    #[test]
    fn value_metadata_keeps_binary_value_with_separators() {
        let vmd = ValueMetadata {
            attr_name: "member".to_string(),
            metadata: metadata(1, "dc-1"),
            op: ValueOp::Delete,
            value: Bytes::from_static(b"cn=a:b,\x00dc=x"),
        };

        let encoded = vmd.to_bytes();
        assert!(encoded.starts_with(b"member:17:1:dc-1:20210304050607.089:12:1:12:"));
        assert_eq!(ValueMetadata::from_bytes(&encoded), Ok(vmd));
    }

    #[test]
    fn value_metadata_detects_length_mismatch() {
        let err = ValueMetadata::from_bytes(b"member:1:1:dc:t:1:0:5:abc").unwrap_err();
        assert_eq!(
            err,
            MetadataParseError::ValueLength {
                declared: 5,
                remaining: 3
            }
        );
    }
}
