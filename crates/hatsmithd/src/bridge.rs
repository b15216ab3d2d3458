//! Download bridge: the intercepted download path
//!
//! A GET on the download path is answered at once with a streaming body,
//! whether or not a job is armed yet. The body is the consumer end of the
//! hub's current output stream; whichever side arrives first creates the
//! pipe. While one download is streaming, further requests get 409.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use hatsmith_transfer::sink::sanitize_file_name;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::daemon::AppState;

pub fn routes(path: &str) -> Router<AppState> {
    Router::new().route(path, get(download_handler))
}

async fn download_handler(State(state): State<AppState>) -> Response {
    let Some(body) = state.hub.attach() else {
        state.metrics.downloads_rejected.inc();
        warn!("download requested while another download is streaming");
        return (StatusCode::CONFLICT, "a download is already in progress").into_response();
    };
    state.metrics.downloads_started.inc();

    let name = sanitize_file_name(body.file_name(), state.hub.default_file_name());
    info!(file = %name, "download attached");

    let streamed = state.metrics.bytes_streamed.clone();
    let stream = body.into_stream().map(move |item| {
        if let Ok(bytes) = &item {
            streamed.inc_by(bytes.len() as u64);
        }
        item
    });

    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use crate::daemon::{router, AppState};
    use axum::body::{Body, Bytes};
    use axum::http::{header, Request, StatusCode};
    use hatsmith_crypto::Provider;
    use hatsmith_transfer::DownloadHub;
    use tower::ServiceExt;

    const PATH: &str = "/api/download-file";

    fn setup() -> (axum::Router, DownloadHub) {
        let hub = DownloadHub::new(4, "encrypted_file.enc", None);
        let state = AppState::new(hub.clone(), Provider::new());
        (router(state, PATH, true), hub)
    }

    fn request() -> Request<Body> {
        Request::get(PATH).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_streams_armed_output() {
        let (app, hub) = setup();
        let mut out = hub.arm("report.pdf.enc");
        let writer = tokio::spawn(async move {
            out.write(Bytes::from_static(b"sealed ")).await.unwrap();
            out.write(Bytes::from_static(b"bytes")).await.unwrap();
            out.close();
        });

        let resp = app.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.pdf.enc\""
        );
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(&body[..], b"sealed bytes");
    }

    #[tokio::test]
    async fn test_consumer_first_gets_default_name() {
        let (app, hub) = setup();
        let resp = app.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"encrypted_file.enc\""
        );

        let mut out = hub.arm("late.enc");
        tokio::spawn(async move {
            out.write(Bytes::from_static(b"late")).await.unwrap();
            out.close();
        });
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"late");
    }

    #[tokio::test]
    async fn test_second_consumer_conflicts() {
        let (app, hub) = setup();
        let _out = hub.arm("busy.enc");
        let _first = hub.attach().expect("first consumer attaches");

        let resp = app.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_aborted_output_fails_body() {
        let (app, hub) = setup();
        let mut out = hub.arm("broken.enc");
        let resp = app.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        out.write(Bytes::from_static(b"partial")).await.unwrap();
        out.abort("authentication failed");
        assert!(axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .is_err());
        assert_eq!(hub.live_streams(), 0);
    }
}
