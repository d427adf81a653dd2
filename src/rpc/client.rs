//! Thin JSON-RPC client used by external drivers and the CLI.

use crate::{
    content::ContentId,
    rpc::{
        AddrInfo, ErrorObject, IdRequest, IdResponse, LookupRequest, LookupResponse,
        NumHostsResponse, ProvideRequest, Request, Response, JSONRPC_VERSION, METHOD_ID,
        METHOD_LOOKUP, METHOD_NUM_HOSTS, METHOD_PROVIDE,
    },
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rpc request failed")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Server(#[from] ErrorObject),
    #[error("malformed rpc response")]
    Malformed(#[from] serde_json::Error),
}

/// Client for the control-plane server.
///
/// Cheaply cloneable; clones share one HTTP connection pool.
#[derive(Clone)]
pub struct Client {
    endpoint: String,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl Client {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn num_hosts(&self) -> Result<usize, ClientError> {
        let response: NumHostsResponse = self
            .call(METHOD_NUM_HOSTS, &serde_json::json!({}))
            .await?;
        Ok(response.num_hosts)
    }

    pub async fn provide(&self, host_index: usize, cids: &[ContentId]) -> Result<(), ClientError> {
        let _: Value = self
            .call(
                METHOD_PROVIDE,
                &ProvideRequest {
                    host_index: host_index as i64,
                    cids: cids.to_vec(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn lookup(
        &self,
        host_index: usize,
        cid: &ContentId,
        prefix_length: u16,
    ) -> Result<Vec<AddrInfo>, ClientError> {
        let response: LookupResponse = self
            .call(
                METHOD_LOOKUP,
                &LookupRequest {
                    host_index: host_index as i64,
                    cid: cid.clone(),
                    prefix_length: u64::from(prefix_length),
                },
            )
            .await?;
        Ok(response.providers)
    }

    pub async fn id(&self, host_index: usize) -> Result<String, ClientError> {
        let response: IdResponse = self
            .call(
                METHOD_ID,
                &IdRequest {
                    host_index: host_index as i64,
                },
            )
            .await?;
        Ok(response.peer_id)
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, ClientError> {
        let request = Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
            id: Value::from(self.next_id.fetch_add(1, Ordering::Relaxed)),
        };

        let response: Response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(error.into());
        }

        Ok(serde_json::from_value(
            response.result.unwrap_or(Value::Null),
        )?)
    }
}
