// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use promtail_core::client::Sink;
use promtail_core::config::Config;
use promtail_core::firehose::{self, FirehoseResponse};

/// Firehose buffers at most 64 MiB per delivery before base64 inflation.
const MAX_REQUEST_BODY_BYTES: usize = 96 * 1024 * 1024;

/// Accepts Firehose HTTP endpoint deliveries until `shutdown` is cancelled.
pub async fn serve(
    config: Arc<Config>,
    sink: Arc<dyn Sink>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    debug!("Listening for Firehose deliveries on {addr}");

    let service = service_fn(move |req| {
        let config = config.clone();
        let sink = sink.clone();
        delivery_handler(config, sink, req)
    });

    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
            () = shutdown.cancelled() => {
                debug!("Shutting down, waiting for {} open connections", joinset.len());
                while joinset.join_next().await.is_some() {}
                return Ok(());
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                error!("Connection error: {e}");
            }
        });
    }
}

async fn delivery_handler(
    config: Arc<Config>,
    sink: Arc<dyn Sink>,
    req: Request<Incoming>,
) -> http::Result<Response<Full<Bytes>>> {
    if req.method() != Method::POST {
        let response = FirehoseResponse {
            error_message: format!("method {} not allowed", req.method()),
            ..FirehoseResponse::default()
        };
        return json_response(StatusCode::METHOD_NOT_ALLOWED, &response);
    }

    let (parts, body) = req.into_parts();
    let body = match read_body(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err((status, message)) => {
            error!("{message}");
            let response = FirehoseResponse {
                error_message: message,
                ..FirehoseResponse::default()
            };
            return json_response(status, &response);
        }
    };

    let (status, response) = firehose::handle(config, sink, &parts.headers, &body).await;
    json_response(status, &response)
}

/// Collects at most `limit` bytes of `body`.
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, (StatusCode, String)>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {limit} bytes"),
        )),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            format!("error reading request body: {e}"),
        )),
    }
}

fn json_response(
    status: StatusCode,
    response: &FirehoseResponse,
) -> http::Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(response.to_json())))
}
