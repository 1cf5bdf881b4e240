//! # Post wire format
//!
//! Protobuf encoding of [`Post`] through [`PostRecord`]. Decoding re-encodes
//! the result; anything that does not reproduce the input byte for byte
//! (unknown fields, reordered fields, explicit defaults) is treated as
//! tampered.

use bytes::Bytes;
use prost::Message;
use thiserror::Error;

use crate::models::Post;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("re-serialized post differs from its source")]
    NotCanonical,
}

/// Protobuf message for a post. Field numbers 1, 2, 9 and 10 are reserved.
#[derive(Clone, PartialEq, Message)]
pub struct PostRecord {
    #[prost(double, tag = "3")]
    pub time: f64,
    #[prost(string, tag = "4")]
    pub com: String,
    #[prost(string, tag = "5")]
    pub sub: String,
    #[prost(string, tag = "6")]
    pub name: String,
    #[prost(string, tag = "7")]
    pub trip: String,
    #[prost(string, tag = "8")]
    pub resto: String,
    #[prost(string, tag = "11")]
    pub filename: String,
    #[prost(string, tag = "12")]
    pub ext: String,
    #[prost(string, tag = "13")]
    pub tim: String,
    #[prost(int32, tag = "14")]
    pub w: i32,
    #[prost(int32, tag = "15")]
    pub h: i32,
    #[prost(string, tag = "16")]
    pub sha256: String,
    #[prost(string, tag = "17")]
    pub md5: String,
    #[prost(double, tag = "18")]
    pub fsize: f64,
    #[prost(string, tag = "19")]
    pub mime: String,
}

impl From<&Post> for PostRecord {
    fn from(post: &Post) -> Self {
        Self {
            time: post.time,
            com: post.com.clone(),
            sub: post.sub.clone(),
            name: post.name.clone(),
            trip: post.trip.clone(),
            resto: post.resto.clone(),
            filename: post.filename.clone(),
            ext: post.ext.clone(),
            tim: post.tim.clone(),
            w: post.w,
            h: post.h,
            sha256: post.sha256.clone(),
            md5: post.md5.clone(),
            fsize: post.fsize,
            mime: post.mime.clone(),
        }
    }
}

impl From<PostRecord> for Post {
    fn from(record: PostRecord) -> Self {
        Self {
            time: record.time,
            com: record.com,
            sub: record.sub,
            name: record.name,
            trip: record.trip,
            resto: record.resto,
            filename: record.filename,
            ext: record.ext,
            tim: record.tim,
            w: record.w,
            h: record.h,
            sha256: record.sha256,
            md5: record.md5,
            fsize: record.fsize,
            mime: record.mime,
        }
    }
}

/// Serializes a post. Output is deterministic for a given post.
pub fn encode_post(post: &Post) -> Bytes {
    Bytes::from(PostRecord::from(post).encode_to_vec())
}

/// Deserializes a post and verifies the encoding is canonical.
pub fn decode_post(input: &[u8]) -> Result<Post, WireError> {
    let record = PostRecord::decode(input)?;
    if record.encode_to_vec() != input {
        return Err(WireError::NotCanonical);
    }
    Ok(record.into())
}
