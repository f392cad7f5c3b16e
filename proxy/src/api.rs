//! HTTP surface of the proxy.
use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rand::RngCore;
use schemars::schema_for;
use serde::Deserialize;
use serde_json::json;
use stampede_common::{
    load_test::{CreatedLoadTest, LoadTestList, LoadTestView, Phase},
    telemetry::Metrics,
};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::{
    cluster::ClusterState,
    error::{Error, Result},
    loadtest::{self, ListFilter, LoadTestSpec},
    utils::{Clock, Context},
};

/// State shared by all handlers.
pub struct ApiState<S, R, C> {
    cx: Arc<Context<S, R, C>>,
    metrics: Option<Arc<Metrics>>,
}

impl<S, R, C> Clone for ApiState<S, R, C> {
    fn clone(&self) -> Self {
        Self {
            cx: self.cx.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Build the router exposing the load test operations.
pub fn router<S, R, C>(cx: Arc<Context<S, R, C>>, metrics: Option<Arc<Metrics>>) -> Router
where
    S: ClusterState + 'static,
    R: RngCore + Send + 'static,
    C: Clock + 'static,
{
    Router::new()
        .route(
            "/load-test",
            get(list_load_tests::<S, R, C>).post(create_load_test::<S, R, C>),
        )
        .route(
            "/load-test/{id}",
            get(get_load_test::<S, R, C>).delete(delete_load_test::<S, R, C>),
        )
        .route("/load-test/{id}/logs", get(master_logs::<S, R, C>))
        .route("/load-test/{id}/logs/{worker}", get(worker_logs::<S, R, C>))
        .route(
            "/load-test/{id}/report",
            get(show_report::<S, R, C>).put(persist_report::<S, R, C>),
        )
        .route("/status", get(status))
        .route("/openapi", get(api_description))
        .route("/metrics", get(render_metrics::<S, R, C>))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { cx, metrics })
}

async fn create_load_test<S, R, C>(
    State(state): State<ApiState<S, R, C>>,
    Json(spec): Json<LoadTestSpec>,
) -> Result<(StatusCode, Json<CreatedLoadTest>)>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    let created = loadtest::create(state.cx, spec).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Query of a list request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    page_token: Option<String>,
    limit: Option<usize>,
    /// Comma separated `key:value` pairs.
    tags: Option<String>,
    phase: Option<String>,
}

impl ListQuery {
    fn filter(&self) -> Result<ListFilter> {
        let mut tags = BTreeMap::new();
        for pair in self
            .tags
            .iter()
            .flat_map(|tags| tags.split(','))
            .filter(|pair| !pair.is_empty())
        {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| Error::Validation(format!("invalid tag filter {pair}")))?;
            tags.insert(key.trim().to_owned(), value.trim().to_owned());
        }
        let phase = self
            .phase
            .as_deref()
            .filter(|phase| !phase.is_empty())
            .map(|phase| phase.parse::<Phase>())
            .transpose()
            .map_err(|err| Error::Validation(format!("unknown phase {}", err.0)))?;
        Ok(ListFilter { tags, phase })
    }
}

async fn list_load_tests<S, R, C>(
    State(state): State<ApiState<S, R, C>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<LoadTestList>>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    let filter = query.filter()?;
    let list = loadtest::list(
        state.cx,
        query.page_token.as_deref(),
        query.limit,
        &filter,
    )
    .await?;
    Ok(Json(list))
}

async fn get_load_test<S, R, C>(
    State(state): State<ApiState<S, R, C>>,
    Path(id): Path<String>,
) -> Result<Json<LoadTestView>>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    Ok(Json(loadtest::get(state.cx, &id).await?))
}

async fn delete_load_test<S, R, C>(
    State(state): State<ApiState<S, R, C>>,
    Path(id): Path<String>,
) -> Result<StatusCode>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    loadtest::delete(state.cx, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn master_logs<S, R, C>(
    State(state): State<ApiState<S, R, C>>,
    Path(id): Path<String>,
) -> Result<Response>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    logs(state, &id, None).await
}

async fn worker_logs<S, R, C>(
    State(state): State<ApiState<S, R, C>>,
    Path((id, worker)): Path<(String, String)>,
) -> Result<Response>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    let worker = worker
        .parse::<u32>()
        .map_err(|_| Error::Validation(format!("invalid worker index {worker}")))?;
    logs(state, &id, Some(worker)).await
}

async fn logs<S, R, C>(
    state: ApiState<S, R, C>,
    id: &str,
    worker: Option<u32>,
) -> Result<Response>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    let stream = loadtest::logs(state.cx, id, worker).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn persist_report<S, R, C>(
    State(state): State<ApiState<S, R, C>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    loadtest::persist_report(state.cx, &id, body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn show_report<S, R, C>(
    State(state): State<ApiState<S, R, C>>,
    Path(id): Path<String>,
) -> Result<Vec<u8>>
where
    S: ClusterState,
    R: RngCore + Send,
    C: Clock,
{
    loadtest::show_report(state.cx, &id).await
}

async fn status() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Routes served by the proxy, as method and path template.
const ROUTES: &[(&str, &str)] = &[
    ("GET", "/load-test"),
    ("POST", "/load-test"),
    ("GET", "/load-test/{id}"),
    ("DELETE", "/load-test/{id}"),
    ("GET", "/load-test/{id}/logs"),
    ("GET", "/load-test/{id}/logs/{worker}"),
    ("GET", "/load-test/{id}/report"),
    ("PUT", "/load-test/{id}/report"),
    ("GET", "/status"),
    ("GET", "/openapi"),
    ("GET", "/metrics"),
];

/// Describe the routes and the JSON schemas of the request and response bodies.
async fn api_description() -> Json<serde_json::Value> {
    let routes: Vec<_> = ROUTES
        .iter()
        .map(|(method, path)| json!({ "method": method, "path": path }))
        .collect();
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "routes": routes,
        "schemas": {
            "LoadTestSpec": schema_for!(LoadTestSpec),
            "CreatedLoadTest": schema_for!(CreatedLoadTest),
            "LoadTestView": schema_for!(LoadTestView),
            "LoadTestList": schema_for!(LoadTestList),
        },
    }))
}

async fn render_metrics<S, R, C>(State(state): State<ApiState<S, R, C>>) -> Result<String> {
    match &state.metrics {
        Some(metrics) => Ok(metrics.encode()?),
        None => Ok(String::new()),
    }
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::InvalidSpec(_) | Error::UnknownBackend(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateBackend(_)
            | Error::Kube { .. }
            | Error::Io { .. }
            | Error::App { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidSpec(_) => "INVALID_SPEC",
            Error::UnknownBackend(_) => "UNKNOWN_BACKEND",
            Error::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::DuplicateBackend(_)
            | Error::Kube { .. }
            | Error::Io { .. }
            | Error::App { .. } => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(err = ?self, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, Request};
    use serde_json::Value;
    use stampede_common::load_test::UnitState;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        backend::Role,
        cluster::stub::StubCluster,
        config::Limits,
        utils::test::TestClock,
    };
    use rand::rngs::mock::StepRng;

    type TestContext = Context<StubCluster, StepRng, TestClock>;

    fn test_router(limits: Limits) -> (Arc<TestContext>, Router) {
        let cx = Context::test(StubCluster::default(), limits);
        (cx.clone(), router(cx, None))
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn create_then_capacity_exceeded() {
        let (_, router) = test_router(Limits {
            max_load_tests_run: 1,
            ..Default::default()
        });
        let spec = json!({"backend": "fake", "workers": 1});

        let response = send(&router, Method::POST, "/load-test", Some(spec.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["phase"], "Pending");
        assert!(created["id"].as_str().unwrap().starts_with("loadtest-"));

        let response = send(&router, Method::POST, "/load-test", Some(spec)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "CAPACITY_EXCEEDED");
        assert_eq!(body["error"]["status"], 429);
    }

    #[tokio::test]
    async fn invalid_requests_are_bad_requests() {
        let (_, router) = test_router(Limits::default());
        for spec in [
            json!({"backend": "fake", "workers": 10}),
            json!({"backend": "gatling", "workers": 1}),
            json!({"backend": "k6", "workers": 1}),
        ] {
            let response = send(&router, Method::POST, "/load-test", Some(spec)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let response = send(&router, Method::GET, "/load-test?phase=done", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&router, Method::GET, "/load-test?pageToken=zz", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_and_delete() {
        let (_, router) = test_router(Limits::default());
        let response = send(&router, Method::GET, "/load-test/loadtest-nope", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let response = send(
            &router,
            Method::POST,
            "/load-test",
            Some(json!({"backend": "fake", "workers": 2, "tags": {"team": "perf"}})),
        )
        .await;
        let id = body_json(response).await["id"].as_str().unwrap().to_owned();

        let response = send(&router, Method::GET, &format!("/load-test/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let view = body_json(response).await;
        assert_eq!(view["backend"], "fake");
        assert_eq!(view["status"]["phase"], "Pending");
        assert_eq!(view["status"]["workers"].as_array().unwrap().len(), 2);

        let response = send(&router, Method::GET, "/load-test?tags=team:perf", None).await;
        assert_eq!(body_json(response).await["items"].as_array().unwrap().len(), 1);
        let response = send(&router, Method::GET, "/load-test?tags=team:other", None).await;
        assert_eq!(body_json(response).await["items"].as_array().unwrap().len(), 0);

        for _ in 0..2 {
            let response = send(&router, Method::DELETE, &format!("/load-test/{id}"), None).await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
        let response = send(&router, Method::GET, &format!("/load-test/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_are_streamed() {
        let (cx, router) = test_router(Limits::default());
        let response = send(
            &router,
            Method::POST,
            "/load-test",
            Some(json!({"backend": "fake", "workers": 1})),
        )
        .await;
        let id = body_json(response).await["id"].as_str().unwrap().to_owned();

        let response = send(&router, Method::GET, &format!("/load-test/{id}/logs"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        cx.cluster.set_state(&id, Role::Master, UnitState::Running);
        cx.cluster.set_logs(&id, Role::Master, b"summary\n");
        let response = send(&router, Method::GET, &format!("/load-test/{id}/logs"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(&body_bytes(response).await[..], b"summary\n");

        let response = send(&router, Method::GET, &format!("/load-test/{id}/logs/3"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(&router, Method::GET, &format!("/load-test/{id}/logs/x"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reports() {
        let (_, router) = test_router(Limits::default());
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/load-test/loadtest-nope/report")
            .body(Body::from("<html/>"))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &router,
            Method::POST,
            "/load-test",
            Some(json!({"backend": "fake", "workers": 1})),
        )
        .await;
        let id = body_json(response).await["id"].as_str().unwrap().to_owned();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("/load-test/{id}/report"))
            .body(Body::from("<html/>"))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&router, Method::GET, &format!("/load-test/{id}/report"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_bytes(response).await[..], b"<html/>");
    }

    #[tokio::test]
    async fn status_and_metrics() {
        let (_, router) = test_router(Limits::default());
        let response = send(&router, Method::GET, "/status", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
        let response = send(&router, Method::GET, "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn describes_routes_and_schemas() {
        let (_, router) = test_router(Limits::default());
        let response = send(&router, Method::GET, "/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let description = body_json(response).await;
        assert!(description["routes"]
            .as_array()
            .unwrap()
            .contains(&json!({ "method": "POST", "path": "/load-test" })));
        let spec = &description["schemas"]["LoadTestSpec"];
        assert_eq!(spec["title"], "LoadTestSpec");
        assert!(spec["properties"]["backend"].is_object());
        assert!(spec["properties"]["workers"].is_object());
        assert_eq!(description["schemas"]["LoadTestView"]["title"], "LoadTestView");
    }

    #[test]
    fn list_query_filter() {
        let query = ListQuery {
            tags: Some("team:perf, env:staging".to_owned()),
            phase: Some("running".to_owned()),
            ..Default::default()
        };
        let filter = query.filter().unwrap();
        assert_eq!(filter.tags["env"], "staging");
        assert_eq!(filter.phase, Some(Phase::Running));
        let query = ListQuery {
            tags: Some("team".to_owned()),
            ..Default::default()
        };
        assert!(matches!(query.filter(), Err(Error::Validation(_))));
    }
}
