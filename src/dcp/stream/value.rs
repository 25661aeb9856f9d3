//! Turning cached change records into wire responses.
//!
//! The cached `Arc<Item>` is shared with the checkpoint log and never
//! mutated; whenever the value has to change shape the response carries a
//! fresh copy.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::value::{compress, decompress, split_xattrs};
use crate::core::{Datatype, Item, Operation, ValueError};

use crate::dcp::message::{DcpResponse, open_flags};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncludeValue {
    Yes,
    No,
    /// No body, but keep the datatype the body had.
    NoWithUnderlyingDatatype,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncludeXattrs {
    Yes,
    No,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncludeDeleteTime {
    Yes,
    No,
}

/// What a producer connection negotiated for item responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseOptions {
    pub include_value: IncludeValue,
    pub include_xattrs: IncludeXattrs,
    pub include_delete_time: IncludeDeleteTime,
    pub compression: bool,
    pub force_compression: bool,
    pub expiry_opcode: bool,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            include_value: IncludeValue::Yes,
            include_xattrs: IncludeXattrs::No,
            include_delete_time: IncludeDeleteTime::No,
            compression: false,
            force_compression: false,
            expiry_opcode: false,
        }
    }
}

impl ResponseOptions {
    pub fn from_open_flags(flags: u32) -> Self {
        let include_value = if flags & open_flags::NO_VALUE_WITH_UNDERLYING_DATATYPE != 0 {
            IncludeValue::NoWithUnderlyingDatatype
        } else if flags & open_flags::NO_VALUE != 0 {
            IncludeValue::No
        } else {
            IncludeValue::Yes
        };
        let include_xattrs = if flags & open_flags::INCLUDE_XATTRS != 0 {
            IncludeXattrs::Yes
        } else {
            IncludeXattrs::No
        };
        let include_delete_time = if flags & open_flags::INCLUDE_DELETE_TIMES != 0 {
            IncludeDeleteTime::Yes
        } else {
            IncludeDeleteTime::No
        };
        Self {
            include_value,
            include_xattrs,
            include_delete_time,
            ..Self::default()
        }
    }

    fn needs_pruning(&self, item: &Item) -> bool {
        self.include_value != IncludeValue::Yes
            || (self.include_xattrs == IncludeXattrs::No && item.datatype.has_xattrs())
    }
}

/// Build the response for `item` under the connection's negotiated options.
pub fn make_response_from_item(
    opaque: u32,
    item: &Arc<Item>,
    opts: &ResponseOptions,
) -> Result<DcpResponse, ValueError> {
    let shaped = if opts.needs_pruning(item) {
        Arc::new(prune(item, opts)?)
    } else {
        reencode(item, opts)?
    };
    let include_delete_time = opts.include_delete_time == IncludeDeleteTime::Yes;
    let msg = match shaped.operation {
        Operation::Expiration if !opts.expiry_opcode => DcpResponse::Deletion {
            opaque,
            item: shaped,
            include_delete_time,
        },
        _ => DcpResponse::from_item(opaque, shaped, include_delete_time),
    };
    Ok(msg)
}

/// Adjust compression for an item whose value is sent whole.
fn reencode(item: &Arc<Item>, opts: &ResponseOptions) -> Result<Arc<Item>, ValueError> {
    let compressed = item.datatype.is_compressed();
    if compressed && !opts.compression {
        let raw = decompress(&item.value)?;
        let datatype = item.datatype.without(Datatype::COMPRESSED);
        return Ok(Arc::new(item.with_value(raw, datatype)));
    }
    if !compressed && opts.compression && !item.value.is_empty() {
        let packed = compress(&item.value);
        if opts.force_compression || packed.len() < item.value.len() {
            let datatype = item.datatype.with(Datatype::COMPRESSED);
            return Ok(Arc::new(item.with_value(packed, datatype)));
        }
    }
    Ok(Arc::clone(item))
}

/// Strip the body and/or xattrs. The result is never recompressed.
fn prune(item: &Item, opts: &ResponseOptions) -> Result<Item, ValueError> {
    let plain = if item.datatype.is_compressed() {
        decompress(&item.value)?
    } else {
        item.value.clone()
    };
    let (xattrs, body) = if item.datatype.has_xattrs() {
        split_xattrs(&plain)?
    } else {
        (Bytes::new(), plain)
    };

    let keep_xattrs = opts.include_xattrs == IncludeXattrs::Yes && !xattrs.is_empty();
    let keep_body = opts.include_value == IncludeValue::Yes;

    let mut value = BytesMut::new();
    if keep_xattrs {
        value.put_slice(&xattrs);
    }
    if keep_body {
        value.put_slice(&body);
    }

    let mut datatype = Datatype::RAW;
    if keep_xattrs {
        datatype = datatype.with(Datatype::XATTR);
    }
    let json_survives = keep_body || opts.include_value == IncludeValue::NoWithUnderlyingDatatype;
    if item.datatype.is_json() && json_survives {
        datatype = datatype.with(Datatype::JSON);
    }
    Ok(item.with_value(value.freeze(), datatype))
}
