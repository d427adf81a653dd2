//! Control-plane server: JSON-RPC 2.0 over HTTP, dispatching fleet
//! operations by host index.

use crate::{
    config,
    fleet::Fleet,
    node::PeerNode,
    rpc::{
        AddrInfo, ErrorObject, IdRequest, IdResponse, LookupRequest, LookupResponse,
        NumHostsResponse, ProvideRequest, Request, Response, INTERNAL_ERROR, INVALID_PARAMS,
        METHOD_ID, METHOD_LOOKUP, METHOD_NOT_FOUND, METHOD_NUM_HOSTS, METHOD_PROVIDE, PARSE_ERROR,
        SERVER_ERROR,
    },
};
use axum::{extract::State, routing::post, Json, Router};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{io, net::SocketAddr};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

/// The running control-plane server.
///
/// Dispatch-only over a fixed, already-started fleet; no operation mutates
/// fleet membership.
pub struct Server {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Server {
    /// Bind `listen` and start serving the fleet.
    pub async fn start(fleet: Fleet, listen: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;

        let app = Router::new().route("/", post(handle)).with_state(fleet);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

            if let Err(error) = serve.await {
                log::warn!("rpc server error: {}", error);
            }
        });

        log::info!("rpc server listening on http://{}", addr);

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The URL clients should post requests to.
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop serving and wait for the server task to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.task.await;
    }
}

async fn handle(State(fleet): State<Fleet>, body: String) -> Json<Response> {
    let request: Request = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(error) => {
            return Json(Response::failure(
                Value::Null,
                ErrorObject {
                    code: PARSE_ERROR,
                    message: format!("failed to parse request: {}", error),
                },
            ))
        }
    };

    let id = request.id.clone();

    match dispatch(&fleet, request).await {
        Ok(result) => Json(Response::success(id, result)),
        Err(error) => Json(Response::failure(id, error)),
    }
}

async fn dispatch(fleet: &Fleet, request: Request) -> Result<Value, ErrorObject> {
    match request.method.as_str() {
        METHOD_NUM_HOSTS => to_result(NumHostsResponse {
            num_hosts: fleet.len(),
        }),
        METHOD_PROVIDE => {
            let params: ProvideRequest = parse_params(request.params)?;
            let node = host(fleet, params.host_index)?;

            node.provide(&params.cids).await;
            Ok(Value::Null)
        }
        METHOD_LOOKUP => {
            let params: LookupRequest = parse_params(request.params)?;

            // Bounds-checked before any network call is issued.
            let prefix_length =
                config::validate_prefix_length(params.prefix_length).map_err(|error| {
                    ErrorObject {
                        code: INVALID_PARAMS,
                        message: error.to_string(),
                    }
                })?;

            let node = host(fleet, params.host_index)?;
            let providers = node
                .lookup(&params.cid, prefix_length)
                .await
                .map_err(|error| ErrorObject {
                    code: SERVER_ERROR,
                    message: error_chain(&error),
                })?;

            to_result(LookupResponse {
                providers: providers.iter().map(AddrInfo::from).collect(),
            })
        }
        METHOD_ID => {
            let params: IdRequest = parse_params(request.params)?;
            let node = host(fleet, params.host_index)?;

            to_result(IdResponse {
                peer_id: node.addr_record().peer_id.to_string(),
            })
        }
        other => Err(ErrorObject {
            code: METHOD_NOT_FOUND,
            message: format!("unknown method {:?}", other),
        }),
    }
}

/// Resolve a wire-side host index against the fleet. Negative and
/// out-of-range indices never reach node logic.
fn host(fleet: &Fleet, index: i64) -> Result<&PeerNode, ErrorObject> {
    usize::try_from(index)
        .ok()
        .and_then(|index| fleet.get(index))
        .ok_or_else(|| ErrorObject {
            code: SERVER_ERROR,
            message: format!("host index {} out of range", index),
        })
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ErrorObject> {
    serde_json::from_value(params).map_err(|error| ErrorObject {
        code: INVALID_PARAMS,
        message: format!("invalid params: {}", error),
    })
}

fn to_result<T: serde::Serialize>(value: T) -> Result<Value, ErrorObject> {
    serde_json::to_value(value).map_err(|error| ErrorObject {
        code: INTERNAL_ERROR,
        message: error.to_string(),
    })
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}
