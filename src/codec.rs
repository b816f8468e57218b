// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Codecs
//!
//! A [`Codec`] turns a typed message into the bytes of an AMQP body and back.
//! Publishers and consumers are generic over it; [`JsonCodec`] is the default
//! and covers every `serde` type.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes and decodes messages of type `M`.
pub trait Codec<M>: Send + Sync + 'static {
    /// Content type stamped on published messages.
    fn content_type(&self) -> &str;

    /// Fails with [`AmqpError::NotSerializable`].
    fn encode(&self, msg: &M) -> Result<Vec<u8>, AmqpError>;

    /// Fails with [`AmqpError::ParsePayloadError`].
    fn decode(&self, data: &[u8]) -> Result<M, AmqpError>;
}

/// `serde_json` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<M> Codec<M> for JsonCodec
where
    M: Serialize + DeserializeOwned,
{
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, msg: &M) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(msg).map_err(|err| AmqpError::NotSerializable(err.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<M, AmqpError> {
        serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}
