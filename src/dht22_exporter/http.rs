// dht22-exporter - Temperature and humidity metrics exporter for Prometheus
//
// Copyright 2021-2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::metrics::MeasurementStore;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, IntoMakeService};
use axum::Router;
use hyper::server::conn::AddrIncoming;
use prometheus::TEXT_FORMAT;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Server returned by `bind`, ready to be awaited or spawned.
pub type MetricsServer = axum::Server<AddrIncoming, IntoMakeService<Router>>;

/// Global state shared between all HTTP requests via Arc.
pub struct RequestState {
    pub store: Arc<MeasurementStore>,
}

/// Render all metrics in the store in the Prometheus text exposition format. If
/// an error is encountered, an HTTP 500 will be returned and the error will be
/// logged.
pub async fn text_metrics_handler(State(state): State<Arc<RequestState>>) -> Response {
    match state.store.encoded_text() {
        Ok(buf) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", bytes = buf.len());
            ([(CONTENT_TYPE, TEXT_FORMAT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics to text format", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Liveness check. Always succeeds while the process is serving requests, no matter
/// whether the sensor can currently be read.
pub async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Routes for `/metrics` and `/health`. Other methods on these paths get a 405,
/// other paths a 404.
pub fn router(state: Arc<RequestState>) -> Router {
    Router::new()
        .route("/metrics", get(text_metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and return a server for the metrics and health routes.
///
/// Binding happens right away so that errors (address in use, permissions) are
/// returned here instead of when the server is first polled.
pub fn bind(addr: &SocketAddr, state: Arc<RequestState>) -> Result<MetricsServer, hyper::Error> {
    let server = axum::Server::try_bind(addr)?.serve(router(state).into_make_service());
    Ok(server)
}

#[cfg(test)]
mod test {
    use super::{bind, router, RequestState};
    use crate::metrics::MeasurementStore;
    use crate::sensor::test::{reading, timeout};
    use crate::sensor::TemperatureUnit;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> Arc<RequestState> {
        Arc::new(RequestState {
            store: Arc::new(MeasurementStore::new(TemperatureUnit::Fahrenheit).unwrap()),
        })
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(res: axum::response::Response) -> String {
        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_ok_empty_body() {
        let state = state();
        state.store.update(Err(timeout()));

        let res = router(state).oneshot(request(Method::GET, "/health")).await.unwrap();

        assert_eq!(StatusCode::OK, res.status());
        assert_eq!("", body_text(res).await);
    }

    #[tokio::test]
    async fn test_metrics_latest_successful_values() {
        let state = state();
        state.store.update(Ok(reading(20.0, 35.0)));
        state.store.update(Ok(reading(25.0, 45.0)));
        state.store.update(Err(timeout()));

        let res = router(state).oneshot(request(Method::GET, "/metrics")).await.unwrap();

        assert_eq!(StatusCode::OK, res.status());
        assert_eq!(
            prometheus::TEXT_FORMAT,
            res.headers().get("content-type").unwrap().to_str().unwrap()
        );

        let body = body_text(res).await;
        assert!(body.contains("dht22_temperature_fahrenheit 77"));
        assert!(body.contains("dht22_humidity 45"));
        assert!(body.contains("dht22_collections_total 3"));
    }

    #[tokio::test]
    async fn test_metrics_wrong_method() {
        let res = router(state()).oneshot(request(Method::POST, "/metrics")).await.unwrap();
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, res.status());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let res = router(state()).oneshot(request(Method::GET, "/nope")).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, res.status());
    }

    #[tokio::test]
    async fn test_bind_serves_health() {
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server = bind(&addr, state()).unwrap();
        let local = server.local_addr();
        tokio::spawn(server);

        let uri = format!("http://{}/health", local).parse().unwrap();
        let res = hyper::Client::new().get(uri).await.unwrap();

        assert_eq!(StatusCode::OK, res.status());
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let first = bind(&addr, state()).unwrap();
        let second = bind(&first.local_addr(), state());

        assert!(second.is_err());
    }
}
