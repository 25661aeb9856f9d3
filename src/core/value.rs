//! Document value framing: datatype bits, xattr sections and compression.
//!
//! An xattr-bearing value starts with a 4-byte big-endian length of the
//! xattr section, followed by that many bytes of `len key \0 value \0`
//! pairs, followed by the document body. A compressed value is an lz4 block
//! with its decompressed size prepended.

use std::fmt;
use std::ops::BitOr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const XATTR_LEN_PREFIX: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Datatype(u8);

impl Datatype {
    pub const RAW: Datatype = Datatype(0x00);
    pub const JSON: Datatype = Datatype(0x01);
    pub const COMPRESSED: Datatype = Datatype(0x02);
    pub const XATTR: Datatype = Datatype(0x04);

    const ALL: u8 = 0x07;

    pub fn from_bits(bits: u8) -> Result<Self, ValueError> {
        if bits & !Self::ALL != 0 {
            return Err(ValueError::UnknownDatatype { bits });
        }
        Ok(Self(bits))
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Datatype) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: Datatype) -> Datatype {
        Datatype(self.0 | other.0)
    }

    pub const fn without(self, other: Datatype) -> Datatype {
        Datatype(self.0 & !other.0)
    }

    pub const fn is_compressed(self) -> bool {
        self.contains(Self::COMPRESSED)
    }

    pub const fn has_xattrs(self) -> bool {
        self.contains(Self::XATTR)
    }

    pub const fn is_json(self) -> bool {
        self.contains(Self::JSON)
    }
}

impl BitOr for Datatype {
    type Output = Datatype;

    fn bitor(self, rhs: Datatype) -> Datatype {
        self.with(rhs)
    }
}

impl fmt::Debug for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("Datatype(raw)");
        }
        let mut names = Vec::new();
        if self.is_json() {
            names.push("json");
        }
        if self.is_compressed() {
            names.push("compressed");
        }
        if self.has_xattrs() {
            names.push("xattr");
        }
        write!(f, "Datatype({})", names.join("|"))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("compressed value is corrupt: {reason}")]
    Decompress { reason: String },
    #[error("value of {actual} bytes is shorter than the xattr length prefix")]
    XattrTruncated { actual: usize },
    #[error("xattr section of {declared} bytes exceeds value length {actual}")]
    XattrOverflow { declared: usize, actual: usize },
    #[error("unknown datatype bits {bits:#04x}")]
    UnknownDatatype { bits: u8 },
}

pub fn compress(raw: &[u8]) -> Bytes {
    Bytes::from(lz4_flex::compress_prepend_size(raw))
}

pub fn decompress(compressed: &[u8]) -> Result<Bytes, ValueError> {
    lz4_flex::decompress_size_prepended(compressed)
        .map(Bytes::from)
        .map_err(|err| ValueError::Decompress {
            reason: err.to_string(),
        })
}

/// Split an uncompressed xattr-bearing value into (xattr section, body).
///
/// The returned xattr section keeps its length prefix so it can be sent as-is.
pub fn split_xattrs(value: &Bytes) -> Result<(Bytes, Bytes), ValueError> {
    if value.len() < XATTR_LEN_PREFIX {
        return Err(ValueError::XattrTruncated {
            actual: value.len(),
        });
    }
    let mut prefix = [0u8; XATTR_LEN_PREFIX];
    prefix.copy_from_slice(&value[..XATTR_LEN_PREFIX]);
    let declared = u32::from_be_bytes(prefix) as usize;
    let section_end = XATTR_LEN_PREFIX + declared;
    if section_end > value.len() {
        return Err(ValueError::XattrOverflow {
            declared,
            actual: value.len(),
        });
    }
    Ok((value.slice(..section_end), value.slice(section_end..)))
}

/// Build an xattr-bearing value from key/value pairs and a body.
pub fn encode_xattrs<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    body: &[u8],
) -> Bytes {
    let mut section = BytesMut::new();
    for (key, value) in pairs {
        let pair_len = key.len() + 1 + value.len() + 1;
        section.put_u32(pair_len as u32);
        section.put_slice(key.as_bytes());
        section.put_u8(0);
        section.put_slice(value.as_bytes());
        section.put_u8(0);
    }
    let mut out = BytesMut::with_capacity(XATTR_LEN_PREFIX + section.len() + body.len());
    out.put_u32(section.len() as u32);
    out.put_slice(&section);
    out.put_slice(body);
    out.freeze()
}
