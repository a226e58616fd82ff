#![cfg(feature = "openstack")]

//! Runs the OpenStack backend against an in-process fake of Keystone,
//! Glance, Nova and Swift.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uniprov_common::{
    Configuration, Context, Datastore, ErrorKind, ImageStatus, InstanceStatus, RunConfiguration,
};
use uniprov_providers::openstack::{OpenStackCredentials, OpenStackProvider};
use uniprov_providers::{Provider, StagedImage};

const TOKEN: &str = "tok-123";

#[derive(Default)]
struct Cloud {
    base: String,
    images: Vec<Value>,
    servers: Vec<Value>,
    consoles: HashMap<String, String>,
    objects: HashMap<String, usize>,
    reject_upload: bool,
    requests: usize,
    next_id: usize,
}

impl Cloud {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

type Shared = Arc<Mutex<Cloud>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("X-Auth-Token").and_then(|v| v.to_str().ok()) == Some(TOKEN)
}

async fn auth(State(cloud): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    let password = body["auth"]["identity"]["password"]["user"]["password"].as_str();
    if password != Some("secret") {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    let base = cloud.base.clone();
    let catalog = json!({
        "token": { "catalog": [
            { "type": "image", "endpoints": [
                { "interface": "public", "region": "RegionOne", "url": base }
            ]},
            { "type": "compute", "endpoints": [
                { "interface": "public", "region": "RegionOne", "url": format!("{}/compute", base) }
            ]},
            { "type": "object-store", "endpoints": [
                { "interface": "public", "region": "RegionOne", "url": format!("{}/swift", base) }
            ]}
        ]}
    });
    (StatusCode::CREATED, [("X-Subject-Token", TOKEN)], Json(catalog)).into_response()
}

async fn list_images(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let limit: usize = params.get("limit").and_then(|l| l.parse().ok()).unwrap_or(25);
    let matching: Vec<Value> = cloud
        .images
        .iter()
        .filter(|i| match params.get("name") {
            Some(name) => i["name"].as_str() == Some(name.as_str()),
            None => true,
        })
        .cloned()
        .collect();
    let start = match params.get("marker") {
        Some(marker) => matching
            .iter()
            .position(|i| i["id"].as_str() == Some(marker.as_str()))
            .map(|p| p + 1)
            .unwrap_or(matching.len()),
        None => 0,
    };
    let page: Vec<Value> = matching.iter().skip(start).take(limit).cloned().collect();
    let mut body = json!({ "images": page });
    if start + limit < matching.len() {
        if let Some(last) = page.last() {
            body["next"] = json!(format!(
                "/v2/images?marker={}&limit={}",
                last["id"].as_str().unwrap(),
                limit
            ));
        }
    }
    Json(body).into_response()
}

async fn create_image(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let id = cloud.id("img");
    let image = json!({
        "id": id,
        "name": body["name"],
        "status": "queued",
        "created_at": "2026-01-01T00:00:00Z",
        "size": null,
        "disk_format": body["disk_format"],
        "visibility": body["visibility"],
    });
    cloud.images.push(image.clone());
    (StatusCode::CREATED, Json(image)).into_response()
}

async fn show_image(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match cloud.images.iter().find(|i| i["id"] == id) {
        Some(image) => Json(image.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_image(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if cloud.servers.iter().any(|s| s["image"]["id"] == id) {
        return StatusCode::CONFLICT.into_response();
    }
    let before = cloud.images.len();
    cloud.images.retain(|i| i["id"] != id);
    if cloud.images.len() == before {
        return StatusCode::NOT_FOUND.into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn upload_image(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if cloud.reject_upload {
        return (StatusCode::PAYLOAD_TOO_LARGE, "image storage quota exceeded").into_response();
    }
    match cloud.images.iter_mut().find(|i| i["id"] == id) {
        Some(image) => {
            image["status"] = json!("active");
            image["size"] = json!(body.len());
            StatusCode::NO_CONTENT.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn import_image(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let uri = body["method"]["uri"].as_str().unwrap_or_default().to_string();
    let key = uri.rsplit("/swift/").next().unwrap_or_default().to_string();
    let Some(size) = cloud.objects.get(&key).copied() else {
        return (StatusCode::BAD_REQUEST, "source object missing").into_response();
    };
    match cloud.images.iter_mut().find(|i| i["id"] == id) {
        Some(image) => {
            image["status"] = json!("active");
            image["size"] = json!(size);
            StatusCode::ACCEPTED.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_servers(State(cloud): State<Shared>, headers: HeaderMap) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "servers": cloud.servers })).into_response()
}

async fn list_flavors(State(cloud): State<Shared>, headers: HeaderMap) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "flavors": [
        { "id": "1", "name": "m1.tiny" },
        { "id": "2", "name": "m1.small" }
    ]}))
    .into_response()
}

async fn create_server(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let server = &body["server"];
    let image_ref = server["imageRef"].clone();
    if !cloud.images.iter().any(|i| i["id"] == image_ref) {
        return (StatusCode::BAD_REQUEST, "image not found").into_response();
    }
    let id = cloud.id("srv");
    cloud.servers.push(json!({
        "id": id,
        "name": server["name"],
        "status": "BUILD",
        "image": { "id": image_ref },
        "flavor": { "id": server["flavorRef"] },
        "addresses": { "private": [ { "addr": "10.0.0.5" } ] },
        "created": "2026-01-01T00:00:00Z",
    }));
    (StatusCode::ACCEPTED, Json(json!({ "server": { "id": id } }))).into_response()
}

async fn delete_server(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    cloud.servers.retain(|s| s["id"] != id);
    StatusCode::NO_CONTENT.into_response()
}

async fn server_action(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let console = cloud.consoles.get(&id).cloned().unwrap_or_default();
    let Some(server) = cloud.servers.iter_mut().find(|s| s["id"] == id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let status = server["status"].as_str().unwrap_or_default().to_string();

    if body.get("os-start").is_some() {
        if status != "SHUTOFF" {
            return StatusCode::CONFLICT.into_response();
        }
        server["status"] = json!("ACTIVE");
        return StatusCode::ACCEPTED.into_response();
    }
    if body.get("os-stop").is_some() {
        if status != "ACTIVE" {
            return StatusCode::CONFLICT.into_response();
        }
        server["status"] = json!("SHUTOFF");
        return StatusCode::ACCEPTED.into_response();
    }
    if body.get("os-getConsoleOutput").is_some() {
        if status == "BUILD" {
            return StatusCode::CONFLICT.into_response();
        }
        return Json(json!({ "output": console })).into_response();
    }
    StatusCode::BAD_REQUEST.into_response()
}

async fn put_container(State(cloud): State<Shared>, headers: HeaderMap) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    StatusCode::CREATED.into_response()
}

async fn put_object(
    State(cloud): State<Shared>,
    headers: HeaderMap,
    Path((container, object)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let mut cloud = cloud.lock().unwrap();
    cloud.requests += 1;
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    cloud.objects.insert(format!("{}/{}", container, object), body.len());
    StatusCode::CREATED.into_response()
}

async fn spawn_cloud() -> (String, Shared) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let shared: Shared = Arc::new(Mutex::new(Cloud {
        base: base.clone(),
        ..Default::default()
    }));

    let app = Router::new()
        .route("/v3/auth/tokens", post(auth))
        .route("/v2/images", get(list_images).post(create_image))
        .route("/v2/images/:id", get(show_image).delete(delete_image))
        .route("/v2/images/:id/file", put(upload_image))
        .route("/v2/images/:id/import", post(import_image))
        .route("/compute/servers", post(create_server))
        .route("/compute/servers/detail", get(list_servers))
        .route("/compute/servers/:id", axum::routing::delete(delete_server))
        .route("/compute/servers/:id/action", post(server_action))
        .route("/compute/flavors/detail", get(list_flavors))
        .route("/swift/:container", put(put_container))
        .route("/swift/:container/:object", put(put_object))
        .with_state(shared.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base, shared)
}

fn credentials(base: &str, password: &str) -> OpenStackCredentials {
    OpenStackCredentials {
        auth_url: base.to_string(),
        username: "demo".into(),
        password: password.into(),
        project_name: "demo".into(),
        user_domain_name: "Default".into(),
        project_domain_name: "Default".into(),
        region: Some("RegionOne".into()),
    }
}

async fn connected(base: &str) -> OpenStackProvider {
    let mut provider = OpenStackProvider::new()
        .with_credentials(credentials(base, "secret"))
        .with_log_poll_interval(Duration::from_millis(10))
        .with_import_timeout(Duration::from_secs(2));
    provider.initialize().await.unwrap();
    provider
}

fn context(out: &std::path::Path, image: &str, instance: &str) -> Context {
    let mut config = Configuration::new(image);
    config.output_dir = out.to_path_buf();
    let mut run = RunConfiguration::default();
    run.instance_name = instance.to_string();
    run.flavor = Some("m1.tiny".into());
    Context::new(config, run)
}

async fn artifact(ctx: &Context) -> std::path::PathBuf {
    let path = ctx.config.artifact_path();
    tokio::fs::create_dir_all(ctx.output_dir()).await.unwrap();
    tokio::fs::write(&path, vec![7u8; 2048]).await.unwrap();
    path
}

fn set_server_status(cloud: &Shared, name: &str, status: &str) {
    let mut cloud = cloud.lock().unwrap();
    for server in cloud.servers.iter_mut().filter(|s| s["name"] == name) {
        server["status"] = json!(status);
    }
}

#[tokio::test]
async fn bad_credentials_fail_initialize_and_later_calls() {
    let (base, cloud) = spawn_cloud().await;
    let mut provider = OpenStackProvider::new().with_credentials(credentials(&base, "wrong"));

    let err = provider.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);

    let before = cloud.lock().unwrap().requests;
    let err = provider.list_images(&Context::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(cloud.lock().unwrap().requests, before);
}

#[tokio::test]
async fn unreachable_keystone_is_backend_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut provider = OpenStackProvider::new().with_credentials(credentials(&base, "secret"));
    let err = provider.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnreachable);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn direct_upload_publishes_image() {
    let (base, _cloud) = spawn_cloud().await;
    let provider = connected(&base).await;
    let out = tempfile::tempdir().unwrap();
    let ctx = context(out.path(), "gtest", "");

    assert!(provider.list_images(&ctx).await.unwrap().is_empty());
    let path = artifact(&ctx).await;
    let staged = provider.stage_image(&ctx, &path).await.unwrap();
    assert_eq!(staged, StagedImage::Local(path.clone()));

    let image = provider.create_image(&ctx, &staged).await.unwrap();
    assert_eq!(image.status, ImageStatus::Published);
    assert_eq!(image.size_bytes, Some(2048));

    let images = provider.list_images(&ctx).await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "gtest");

    let err = provider.create_image(&ctx, &staged).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    provider.delete_image(&ctx, "gtest").await.unwrap();
    provider.delete_image(&ctx, "gtest").await.unwrap();
    assert!(provider.list_images(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn name_filter_survives_reserved_characters() {
    let (base, _cloud) = spawn_cloud().await;
    let provider = connected(&base).await;
    let out = tempfile::tempdir().unwrap();

    let plain = context(out.path(), "my image", "");
    let path = artifact(&plain).await;
    provider
        .create_image(&plain, &StagedImage::Local(path))
        .await
        .unwrap();

    // Unencoded, "&v2" would split the query and match "my image".
    let tricky = context(out.path(), "my image&v2", "");
    let path = artifact(&tricky).await;
    provider
        .create_image(&tricky, &StagedImage::Local(path.clone()))
        .await
        .unwrap();
    let err = provider
        .create_image(&tricky, &StagedImage::Local(path))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    provider.delete_image(&tricky, "my image&v2").await.unwrap();
    let names: Vec<String> = provider
        .list_images(&plain)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(names, vec!["my image"]);
}

#[tokio::test]
async fn rejected_upload_leaves_no_partial_image() {
    let (base, cloud) = spawn_cloud().await;
    let provider = connected(&base).await;
    let out = tempfile::tempdir().unwrap();
    let ctx = context(out.path(), "gtest", "");
    cloud.lock().unwrap().reject_upload = true;

    let path = artifact(&ctx).await;
    let err = provider
        .create_image(&ctx, &StagedImage::Local(path))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert!(provider.list_images(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn datastore_stages_through_object_storage() {
    let (base, cloud) = spawn_cloud().await;
    let provider = connected(&base).await;
    let out = tempfile::tempdir().unwrap();
    let mut ctx = context(out.path(), "gtest", "");
    ctx.config.datastore = Some(Datastore {
        container: "images".into(),
        region: None,
    });

    let path = artifact(&ctx).await;
    let staged = provider.stage_image(&ctx, &path).await.unwrap();
    let StagedImage::Object(object) = &staged else {
        panic!("expected an object-store staging, got {:?}", staged);
    };
    assert_eq!(object.container, "images");
    assert_eq!(object.key, "gtest.img");
    assert_eq!(object.region.as_deref(), Some("RegionOne"));
    assert_eq!(cloud.lock().unwrap().objects.get("images/gtest.img"), Some(&2048));

    let image = provider.create_image(&ctx, &staged).await.unwrap();
    assert_eq!(image.status, ImageStatus::Published);
}

#[tokio::test]
async fn image_listing_follows_pagination() {
    let (base, _cloud) = spawn_cloud().await;
    let provider = connected(&base).await.with_page_size(1);
    let out = tempfile::tempdir().unwrap();

    for name in ["zeta", "alpha", "mid"] {
        let ctx = context(out.path(), name, "");
        let path = artifact(&ctx).await;
        provider
            .create_image(&ctx, &StagedImage::Local(path))
            .await
            .unwrap();
    }

    let names: Vec<String> = provider
        .list_images(&Context::default())
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}

#[tokio::test]
async fn server_lifecycle() {
    let (base, cloud) = spawn_cloud().await;
    let provider = connected(&base).await;
    let out = tempfile::tempdir().unwrap();
    let ctx = context(out.path(), "gtest", "web");

    let err = provider.create_instance(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageNotFound);

    let path = artifact(&ctx).await;
    provider
        .create_image(&ctx, &StagedImage::Local(path))
        .await
        .unwrap();

    let mut bad_flavor = ctx.clone();
    bad_flavor.run_config.flavor = Some("m9.colossal".into());
    let err = provider.create_instance(&bad_flavor).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let instance = provider.create_instance(&ctx).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Created);
    assert_eq!(instance.flavor.as_deref(), Some("1"));
    let err = provider.create_instance(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = provider.get_instance_logs(&ctx, "web", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LogsNotYetAvailable);
    provider.stop_instance(&ctx, "web").await.unwrap();

    // Nova finishes the build and boots the guest.
    set_server_status(&cloud, "web", "ACTIVE");
    {
        let mut cloud = cloud.lock().unwrap();
        cloud.consoles.insert(instance.id.clone(), "booting web\n".into());
    }
    let listed = provider.list_instances(&ctx).await.unwrap();
    assert_eq!(listed[0].status, InstanceStatus::Running);
    assert_eq!(listed[0].ip_addresses, vec!["10.0.0.5".to_string()]);

    let logs = provider
        .get_instance_logs(&ctx, "web", false)
        .await
        .unwrap()
        .into_snapshot()
        .unwrap();
    assert_eq!(logs, "booting web\n");

    let err = provider.delete_image(&ctx, "gtest").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageInUse);

    provider.stop_instance(&ctx, "web").await.unwrap();
    provider.stop_instance(&ctx, "web").await.unwrap();
    assert_eq!(
        provider.list_instances(&ctx).await.unwrap()[0].status,
        InstanceStatus::Stopped
    );
    provider.start_instance(&ctx, "web").await.unwrap();
    provider.start_instance(&ctx, "web").await.unwrap();

    set_server_status(&cloud, "web", "ERROR");
    let err = provider.start_instance(&ctx, "web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    provider.delete_instance(&ctx, "web").await.unwrap();
    provider.delete_instance(&ctx, "web").await.unwrap();
    let err = provider.start_instance(&ctx, "web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceNotFound);
    provider.delete_image(&ctx, "gtest").await.unwrap();
}

#[tokio::test]
async fn resize_is_a_capability_gap() {
    let (base, _cloud) = spawn_cloud().await;
    let provider = connected(&base).await;
    let err = provider
        .resize_image(&Context::default(), "gtest", "1G")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
}
