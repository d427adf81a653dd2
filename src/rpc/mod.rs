//! Control-plane wire contract.
//!
//! The request/response field names here are normative: external drivers
//! depend on them, so they are spelled out exactly rather than derived from
//! Rust naming.

pub mod client;
pub mod server;

pub use client::{Client, ClientError};
pub use server::Server;

use crate::{content::ContentId, registry::AddrRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_NUM_HOSTS: &str = "dht_numHosts";
pub const METHOD_PROVIDE: &str = "dht_provide";
pub const METHOD_LOOKUP: &str = "dht_lookup";
pub const METHOD_ID: &str = "dht_id";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default)]
    pub id: Value,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Structured JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("server error {code}: {message}")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// A peer identifier plus its advertised network addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddrInfo {
    pub id: String,
    pub addrs: Vec<String>,
}

impl From<&AddrRecord> for AddrInfo {
    fn from(record: &AddrRecord) -> Self {
        Self {
            id: record.peer_id.to_string(),
            addrs: record.addrs.iter().map(|addr| addr.to_string()).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NumHostsResponse {
    #[serde(rename = "numHosts")]
    pub num_hosts: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvideRequest {
    #[serde(rename = "hostIndex")]
    pub host_index: i64,
    pub cids: Vec<ContentId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupRequest {
    #[serde(rename = "hostIndex")]
    pub host_index: i64,
    pub cid: ContentId,
    #[serde(rename = "prefixLength")]
    pub prefix_length: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    pub providers: Vec<AddrInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdRequest {
    #[serde(rename = "hostIndex")]
    pub host_index: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdResponse {
    #[serde(rename = "peerID")]
    pub peer_id: String,
}

// ----------------------------------------------------------------------------//
