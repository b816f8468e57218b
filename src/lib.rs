// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod supervisor;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod forward;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod subscriber;
pub mod topology;
