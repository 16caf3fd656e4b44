//! World view handoff over HTTP: every node serves its current replica, and a
//! newly promoted primary pulls from the surviving peers.
use crate::error::{Error, Result};
use crate::rpc::Handoff;
use crate::store::WorldViewStore;
use crate::world_view::WorldView;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{debug, error, info, trace};
use std::convert::Infallible;
use std::net::ToSocketAddrs;

/// Serves `GET /v1/world_view` on `address` from a background task.
pub fn serve<A: ToSocketAddrs>(address: A, store: WorldViewStore) -> Result<()> {
    for addr in address.to_socket_addrs()? {
        info!(target: "net", "Serving world view at {}", addr);
        let store = store.clone();
        let make_svc = make_service_fn(move |socket: &AddrStream| {
            trace!(target: "net", "Handoff connection from {}", socket.remote_addr());
            let store = store.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let store = store.clone();
                    async move { Ok::<_, Infallible>(serve_request(store, req).await) }
                }))
            }
        });
        let server = Server::try_bind(&addr)
            .map_err(|e| Error::Handoff(format!("binding {}: {}", addr, e)))?
            .serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(target: "net", "Handoff server error: {}", e);
            }
        });
    }
    Ok(())
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

async fn serve_request(store: WorldViewStore, req: Request<Body>) -> Response<Body> {
    trace!(target: "net", "Serving request {} {}", req.method(), req.uri());
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/v1/world_view") => match serde_json::to_vec(&store.snapshot().await) {
            Ok(body) => {
                let mut response = Response::new(Body::from(body));
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("application/json"),
                );
                response
            }
            Err(e) => {
                error!(target: "net", "Failed to encode world view: {}", e);
                status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        _ => status(StatusCode::NOT_FOUND),
    }
}

#[derive(Clone, Default)]
pub struct HttpHandoff {
    client: hyper::Client<hyper::client::HttpConnector>,
}

impl HttpHandoff {
    pub fn new() -> HttpHandoff {
        HttpHandoff {
            client: hyper::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Handoff for HttpHandoff {
    async fn fetch(&self, address: &str) -> Result<WorldView> {
        let uri: hyper::Uri = format!("http://{}/v1/world_view", address)
            .parse()
            .map_err(|e| Error::Handoff(format!("{}: {}", address, e)))?;
        let resp = self
            .client
            .get(uri)
            .await
            .map_err(|e| Error::Handoff(format!("{}: {}", address, e)))?;
        if !resp.status().is_success() {
            debug!(target: "net", "Handoff from {} failed with status {}", address, resp.status());
            return Err(Error::Handoff(format!("{} answered {}", address, resp.status())));
        }
        let bytes = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| Error::Handoff(format!("{}: {}", address, e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_view::{HallButton, HallRequestStatus, Quorum, QuorumPolicy};

    fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn promoted_primary_pulls_world_view() {
        let (store, _changes) = WorldViewStore::new(
            "b".to_string(),
            4,
            0,
            Quorum::new(QuorumPolicy::AssignedOnly, 3),
        );
        store.request_hall(2, HallButton::Up).await;
        let address = free_address();
        serve(address.as_str(), store.clone()).unwrap();

        let view = HttpHandoff::new().fetch(&address).await.unwrap();
        assert_eq!(view.author, "b");
        assert_eq!(view.status(2, HallButton::Up), HallRequestStatus::Unconfirmed);
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_handoff_error() {
        match HttpHandoff::new().fetch(&free_address()).await {
            Err(Error::Handoff(_)) => {}
            other => panic!("unexpected result {:?}", other.map(|v| v.author)),
        }
    }
}
