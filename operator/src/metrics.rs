use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use owo_colors::OwoColorize;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;

async fn serve_req(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        eprintln!("{}", format!("Failed to encode metrics: {}", e).red());
    }
    Ok(Response::new(Body::from(buffer)))
}

/// Serves the default prometheus registry for scraping. Runs for the life of
/// the process; a bind failure panics and the panic hook exits the process.
pub async fn run_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    println!("{}", format!("Serving metrics on {}", addr).green());
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(serve_req)) });
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .expect("metrics server exited");
}
