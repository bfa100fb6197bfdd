// tests/api_status.rs
//
// HTTP-level tests for the status router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /scheduler/status
// - POST /scheduler/run (202, then 409 while a run is active)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use chrono_tz::Australia::Sydney;
use serde_json::Value as Json;
use tokio::sync::Notify;
use tower::ServiceExt as _; // for `oneshot`

use disclosure_pipeline::router;
use disclosure_pipeline::scheduler::{PipelineJob, RunSummary, Scheduler, Trigger};

const BODY_LIMIT: usize = 1024 * 1024;

#[derive(Default)]
struct HeldJob {
    release: Notify,
}

#[async_trait]
impl PipelineJob for HeldJob {
    async fn execute(&self) -> RunSummary {
        self.release.notified().await;
        RunSummary {
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            scraped: 2,
            processed: 2,
            errors: 0,
            aborted: false,
            success_rate: 100.0,
        }
    }
}

fn app() -> (Router, Scheduler, Arc<HeldJob>) {
    let job = Arc::new(HeldJob::default());
    let scheduler = Scheduler::new(job.clone(), Trigger::every_minutes(60), Sydney);
    (router(scheduler.clone(), None), scheduler, job)
}

async fn json_body(resp: axum::response::Response) -> Json {
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build GET")
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .expect("build POST")
}

#[tokio::test]
async fn health_returns_200_and_ok_body() {
    let (app, _, _) = app();
    let resp = app.oneshot(get("/health")).await.expect("oneshot /health");
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn status_reports_idle_scheduler() {
    let (app, _, _) = app();
    let resp = app
        .oneshot(get("/scheduler/status"))
        .await
        .expect("oneshot /scheduler/status");
    assert_eq!(resp.status(), StatusCode::OK);

    let v = json_body(resp).await;
    assert_eq!(v["is_running"], false);
    assert_eq!(v["run_active"], false);
    assert_eq!(v["mode"], "interval");
    assert_eq!(v["timezone"], "Australia/Sydney");
    assert_eq!(v["total_runs"], 0);
    assert!(v["last_run"].is_null());
    assert_eq!(v["scheduled_jobs"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn manual_run_is_accepted_once_then_conflicts() {
    let (app, scheduler, job) = app();

    let first = app.clone().oneshot(post("/scheduler/run")).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(first).await["status"], "started");

    let second = app.clone().oneshot(post("/scheduler/run")).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(second).await["status"], "busy");

    let during = json_body(app.clone().oneshot(get("/scheduler/status")).await.unwrap()).await;
    assert_eq!(during["run_active"], true);
    assert_eq!(during["skipped_overlaps"], 1);

    job.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), async {
        while scheduler.is_run_active() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run finished");

    let after = json_body(app.oneshot(get("/scheduler/status")).await.unwrap()).await;
    assert_eq!(after["total_runs"], 1);
    assert_eq!(after["successful_runs"], 1);
    assert_eq!(after["last_run_success"], true);
    assert_eq!(after["last_run"]["processed"], 2);
}

#[tokio::test]
async fn run_route_rejects_get() {
    let (app, _, _) = app();
    let resp = app.oneshot(get("/scheduler/run")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}
