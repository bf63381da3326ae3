use axum::Router;
use tokio::{net::TcpListener, sync::oneshot};

/// Serves `app` on an ephemeral localhost port and returns its base URL plus a
/// shutdown handle.
pub async fn serve(app: Router) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock listener");
    let address = listener.local_addr().expect("mock listener local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("run mock server");
    });
    (format!("http://{address}"), shutdown_tx)
}
