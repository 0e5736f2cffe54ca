//! Interface to the remote key-value object store.
//!
//! The store is an opaque asynchronous service: a submission returns a request id at once
//! and the matching [`StoreResponse`] arrives later on a channel owned by the caller, in any
//! order relative to other submissions.

use crate::encoding::to_u64_words;
use crate::error::TsdbError;

use std::collections::HashMap;

/// Correlation identifier handed out by the store for every submitted request.
pub type RequestId = u64;

/// Typed attribute value retrieved from an item.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Str(String),
    /// Array attributes come back as raw little-endian bytes.
    Bytes(Vec<u8>),
}

impl AttrValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttrValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Reads an array attribute as u64 words; a trailing partial word is zero padded.
    pub fn to_words(&self) -> Result<Vec<u64>, TsdbError> {
        match self {
            AttrValue::Bytes(b) => Ok(to_u64_words(b)),
            other => Err(TsdbError::corrupt(format!(
                "expected an array attribute, got {:?}",
                other
            ))),
        }
    }
}

/// Attributes of one item, by name.
pub type ItemAttrs = HashMap<String, AttrValue>;

/// Update request: an expression applied to one item.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateItem {
    pub path: String,
    pub expression: String,
}

/// Read request: named attributes of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct GetItemSpec {
    pub path: String,
    pub attrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Updated,
    /// `None` when the item does not exist.
    Item(Option<ItemAttrs>),
}

/// Response correlated to a submitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponse {
    pub request_id: RequestId,
    pub result: Result<ResponseBody, String>,
}

impl StoreResponse {
    pub fn updated(request_id: RequestId) -> Self {
        StoreResponse {
            request_id,
            result: Ok(ResponseBody::Updated),
        }
    }

    pub fn item(request_id: RequestId, attrs: Option<ItemAttrs>) -> Self {
        StoreResponse {
            request_id,
            result: Ok(ResponseBody::Item(attrs)),
        }
    }

    pub fn failed(request_id: RequestId, message: impl Into<String>) -> Self {
        StoreResponse {
            request_id,
            result: Err(message.into()),
        }
    }
}

/// Submission side of the remote store client. Implementations must not block on the
/// response; it is delivered separately as a [`StoreResponse`].
pub trait StoreClient: Send + Sync {
    fn update_item(&self, req: &UpdateItem) -> Result<RequestId, TsdbError>;

    fn get_item(&self, spec: &GetItemSpec) -> Result<RequestId, TsdbError>;
}
