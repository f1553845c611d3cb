use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use keyrelay_router::ConnDisconnect;
use tokio_util::sync::CancellationToken;

mod bootstrap;
mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = cli::CliArgs::parse();
    let boot = bootstrap::bootstrap(&args).await?;

    let app = keyrelay_router::router(boot.core.state());

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");

    // Served by hand rather than `axum::serve` so each connection gets its
    // own `CancellationToken`, inserted as a request extension and
    // cancelled the moment the connection's serve future ends for any
    // reason (clean close, reset, or I/O error). A request still waiting
    // in a service's admission queue, or mid-upstream-dispatch, races
    // against that token (§5's "cancel signal wired through preprocessing,
    // queue wait, and upstream I/O") instead of never observing the
    // client going away until it tries to write a response nobody reads.
    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        let conn_cancel = CancellationToken::new();
        let cancel_on_drop = conn_cancel.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let app = app.clone();
                let conn_cancel = conn_cancel.clone();
                async move {
                    let (mut parts, body) = req.into_parts();
                    parts.extensions.insert(ConnDisconnect(conn_cancel));
                    let req = axum::http::Request::from_parts(parts, axum::body::Body::new(body));
                    let response = tower::ServiceExt::oneshot(app, req).await.unwrap();
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(err) =
                ConnBuilder::new(TokioExecutor::new()).serve_connection_with_upgrades(io, service).await
            {
                tracing::debug!(?err, %peer, "connection closed");
            }
            cancel_on_drop.cancel();
        });
    }
}
