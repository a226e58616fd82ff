//! OpenStack backend: Keystone v3 for the session, Glance v2 for the image
//! catalog, Nova for instances and Swift (when the catalog offers it) for
//! staging raw image bytes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use uniprov_common::{
    Context, Datastore, DiskFormat, Image, ImageStatus, Instance, InstanceStatus, ProviderError,
    Result, Visibility,
};

use crate::{InstanceLogs, LogTail, ObjectStore, Provider, StagedImage, StagedObject};

pub const BACKEND_NAME: &str = "openstack";

/// Password credentials scoped to one project.
#[derive(Debug, Clone)]
pub struct OpenStackCredentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain_name: String,
    pub project_domain_name: String,
    pub region: Option<String>,
}

impl OpenStackCredentials {
    /// Read the standard `OS_*` variables. Any required one missing is an
    /// authentication failure.
    pub fn from_env() -> Result<Self> {
        fn required(key: &str) -> Result<String> {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ProviderError::Authentication(format!("{} is not set", key)))
        }
        fn optional(key: &str) -> Option<String> {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        Ok(Self {
            auth_url: required("OS_AUTH_URL")?,
            username: required("OS_USERNAME")?,
            password: required("OS_PASSWORD")?,
            project_name: required("OS_PROJECT_NAME")?,
            user_domain_name: optional("OS_USER_DOMAIN_NAME").unwrap_or_else(|| "Default".into()),
            project_domain_name: optional("OS_PROJECT_DOMAIN_NAME")
                .unwrap_or_else(|| "Default".into()),
            region: optional("OS_REGION_NAME"),
        })
    }

    fn tokens_url(&self) -> String {
        let base = self.auth_url.trim_end_matches('/');
        if base.ends_with("/v3") {
            format!("{}/auth/tokens", base)
        } else {
            format!("{}/v3/auth/tokens", base)
        }
    }
}

#[derive(Debug)]
struct Session {
    token: String,
    image_url: String,
    compute_url: String,
    object_store_url: Option<String>,
    region: Option<String>,
}

enum SessionState {
    Uninitialized,
    Ready(Arc<Session>),
    Failed(String),
}

pub struct OpenStackProvider {
    client: Client,
    credentials: Option<OpenStackCredentials>,
    state: SessionState,
    page_size: usize,
    log_poll_interval: Duration,
    import_timeout: Duration,
}

impl Default for OpenStackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenStackProvider {
    /// Credentials are read from the environment during `initialize`.
    pub fn new() -> Self {
        // Default reqwest client has no overall timeout. A stalled endpoint must not hang a call.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            credentials: None,
            state: SessionState::Uninitialized,
            page_size: 100,
            log_poll_interval: Duration::from_secs(2),
            import_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_credentials(mut self, credentials: OpenStackCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    pub fn with_import_timeout(mut self, timeout: Duration) -> Self {
        self.import_timeout = timeout;
        self
    }

    fn session(&self) -> Result<Arc<Session>> {
        match &self.state {
            SessionState::Ready(session) => Ok(session.clone()),
            SessionState::Failed(reason) => Err(ProviderError::Authentication(format!(
                "backend '{}' failed to initialize: {}",
                BACKEND_NAME, reason
            ))),
            SessionState::Uninitialized => Err(ProviderError::not_initialized(BACKEND_NAME)),
        }
    }

    async fn authenticate(&self, creds: &OpenStackCredentials) -> Result<Session> {
        let url = creds.tokens_url();
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": creds.username,
                            "domain": { "name": creds.user_domain_name },
                            "password": creds.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": creds.project_name,
                        "domain": { "name": creds.project_domain_name },
                    }
                }
            }
        });

        tracing::info!(
            "🔵 [OpenStack API] POST {} - Authenticating user={} project={}",
            url,
            creds.username,
            creds.project_name
        );
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!("❌ [OpenStack API] POST {} failed: status={}", url, status.as_u16());
            return Err(if status.is_server_error() {
                ProviderError::BackendUnreachable(format!("keystone returned {}", status))
            } else {
                ProviderError::Authentication(format!("keystone returned {}: {}", status, text))
            });
        }

        let token = resp
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::Authentication("no X-Subject-Token in reply".into()))?;
        let reply: TokenReply = resp.json().await.map_err(transport_error)?;
        let region = creds.region.as_deref();

        let image_url = reply.endpoint("image", region).ok_or_else(|| {
            ProviderError::Authentication("service catalog has no image endpoint".into())
        })?;
        let compute_url = reply.endpoint("compute", region).ok_or_else(|| {
            ProviderError::Authentication("service catalog has no compute endpoint".into())
        })?;
        let object_store_url = reply.endpoint("object-store", region);

        tracing::info!(
            "✅ [OpenStack API] Authenticated: image={} compute={} object-store={:?}",
            image_url,
            compute_url,
            object_store_url
        );
        Ok(Session {
            token,
            image_url,
            compute_url,
            object_store_url,
            region: creds.region.clone(),
        })
    }

    async fn send(&self, session: &Session, req: RequestBuilder) -> Result<Response> {
        req.headers(headers(&session.token)?)
            .send()
            .await
            .map_err(transport_error)
    }

    // --- Glance ---

    async fn fetch_images(&self, session: &Session, name: Option<&str>) -> Result<Vec<Image>> {
        let base = session.image_url.trim_end_matches('/');
        let mut url = format!("{}/v2/images?limit={}", base, self.page_size);
        if let Some(name) = name {
            url.push_str("&name=");
            url.push_str(&urlencoding::encode(name));
        }

        let mut images = Vec::new();
        loop {
            tracing::debug!("🔵 [OpenStack API] GET {}", url);
            let resp = self.send(session, self.client.get(&url)).await?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(status_error(status, &text, "list images"));
            }
            let page: ImagePage = resp.json().await.map_err(transport_error)?;
            images.extend(page.images.into_iter().map(GlanceImage::into_image));
            match page.next {
                Some(next) if !next.is_empty() => url = format!("{}{}", base, next),
                _ => break,
            }
        }

        images.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(images)
    }

    async fn fetch_image(&self, session: &Session, id: &str) -> Result<Image> {
        let url = format!("{}/v2/images/{}", session.image_url.trim_end_matches('/'), id);
        let resp = self.send(session, self.client.get(&url)).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::ImageNotFound(id.to_string()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &text, "show image"));
        }
        let image: GlanceImage = resp.json().await.map_err(transport_error)?;
        Ok(image.into_image())
    }

    async fn delete_image_record(&self, session: &Session, id: &str) -> Result<()> {
        let url = format!("{}/v2/images/{}", session.image_url.trim_end_matches('/'), id);
        tracing::info!("🔵 [OpenStack API] DELETE {}", url);
        let resp = self.send(session, self.client.delete(&url)).await?;
        let status = resp.status();
        match status {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            StatusCode::CONFLICT => Err(ProviderError::ImageInUse(id.to_string())),
            _ => {
                let text = resp.text().await.unwrap_or_default();
                Err(status_error(status, &text, "delete image"))
            }
        }
    }

    async fn upload_image_data(&self, session: &Session, id: &str, artifact: &Path) -> Result<()> {
        let url = format!("{}/v2/images/{}/file", session.image_url.trim_end_matches('/'), id);
        let file = tokio::fs::File::open(artifact).await?;
        let size = file.metadata().await?.len();
        tracing::info!(
            "🔵 [OpenStack API] PUT {} - Uploading {} ({} bytes)",
            url,
            artifact.display(),
            size
        );

        let req = self
            .client
            .put(&url)
            .timeout(Duration::from_secs(3600))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Content-Length", size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        let resp = self.send(session, req).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!("❌ [OpenStack API] PUT {} failed: status={}", url, status.as_u16());
            return Err(publish_error(status, &text));
        }
        Ok(())
    }

    async fn import_from_url(&self, session: &Session, id: &str, uri: &str) -> Result<()> {
        let url = format!("{}/v2/images/{}/import", session.image_url.trim_end_matches('/'), id);
        let body = json!({ "method": { "name": "web-download", "uri": uri } });
        tracing::info!("🔵 [OpenStack API] POST {} - web-download from {}", url, uri);

        let resp = self.send(session, self.client.post(&url).json(&body)).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(publish_error(status, &text));
        }
        Ok(())
    }

    /// Poll until the image leaves its transient states.
    async fn wait_for_active(&self, session: &Session, id: &str) -> Result<Image> {
        let deadline = tokio::time::Instant::now() + self.import_timeout;
        loop {
            let image = self.fetch_image(session, id).await?;
            match image.status {
                ImageStatus::Published => return Ok(image),
                ImageStatus::Failed | ImageStatus::Deleted => {
                    return Err(ProviderError::PublishFailed(format!(
                        "image {} ended in status {}",
                        id, image.status
                    )))
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "⚠️ [OpenStack API] Image {} still {} after {}s",
                    id,
                    image.status,
                    self.import_timeout.as_secs()
                );
                return Err(ProviderError::PublishFailed(format!(
                    "image {} not active after {}s",
                    id,
                    self.import_timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(2).min(self.import_timeout)).await;
        }
    }

    // --- Nova ---

    async fn fetch_servers(&self, session: &Session) -> Result<Vec<Instance>> {
        let mut url = format!("{}/servers/detail", session.compute_url.trim_end_matches('/'));
        let mut servers = Vec::new();
        loop {
            tracing::debug!("🔵 [OpenStack API] GET {}", url);
            let resp = self.send(session, self.client.get(&url)).await?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(status_error(status, &text, "list servers"));
            }
            let page: ServerPage = resp.json().await.map_err(transport_error)?;
            servers.extend(page.servers.into_iter().map(NovaServer::into_instance));
            match page
                .servers_links
                .into_iter()
                .find(|l| l.rel == "next")
                .map(|l| l.href)
            {
                Some(next) => url = next,
                None => break,
            }
        }
        servers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(servers)
    }

    async fn find_server(&self, session: &Session, name: &str) -> Result<Option<Instance>> {
        Ok(self
            .fetch_servers(session)
            .await?
            .into_iter()
            .find(|s| s.name == name && s.status != InstanceStatus::Deleted))
    }

    async fn resolve_flavor(&self, session: &Session, flavor: &str) -> Result<String> {
        let url = format!("{}/flavors/detail", session.compute_url.trim_end_matches('/'));
        let resp = self.send(session, self.client.get(&url)).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &text, "list flavors"));
        }
        let json_resp: Value = resp.json().await.map_err(transport_error)?;
        json_resp["flavors"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|f| f["id"].as_str() == Some(flavor) || f["name"].as_str() == Some(flavor))
            .and_then(|f| f["id"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::InvalidArgument(format!("unknown flavor '{}'", flavor)))
    }

    async fn server_action(&self, session: &Session, server_id: &str, body: Value) -> Result<Response> {
        let url = format!(
            "{}/servers/{}/action",
            session.compute_url.trim_end_matches('/'),
            server_id
        );
        tracing::info!("🔵 [OpenStack API] POST {} - {}", url, body);
        self.send(session, self.client.post(&url).json(&body)).await
    }
}

#[async_trait]
impl Provider for OpenStackProvider {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn initialize(&mut self) -> Result<()> {
        let creds = match self.credentials.clone() {
            Some(creds) => creds,
            None => match OpenStackCredentials::from_env() {
                Ok(creds) => creds,
                Err(e) => {
                    tracing::error!("❌ [OpenStack API] {}", e);
                    self.state = SessionState::Failed(e.to_string());
                    return Err(e);
                }
            },
        };

        match self.authenticate(&creds).await {
            Ok(session) => {
                self.state = SessionState::Ready(Arc::new(session));
                Ok(())
            }
            Err(e) => {
                tracing::error!("❌ [OpenStack API] initialize failed: {}", e);
                self.state = SessionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn object_store(&self) -> Option<&dyn ObjectStore> {
        match &self.state {
            SessionState::Ready(session) if session.object_store_url.is_some() => Some(self),
            _ => None,
        }
    }

    async fn create_image(&self, ctx: &Context, staged: &StagedImage) -> Result<Image> {
        let session = self.session()?;
        let name = ctx.config.name.as_str();
        if name.trim().is_empty() {
            return Err(ProviderError::InvalidArgument("image name is empty".into()));
        }

        let existing = self.fetch_images(&session, Some(name)).await?;
        if existing
            .iter()
            .any(|i| i.name == name && i.status != ImageStatus::Deleted)
        {
            return Err(ProviderError::AlreadyExists(format!("image '{}'", name)));
        }

        let url = format!("{}/v2/images", session.image_url.trim_end_matches('/'));
        let body = json!({
            "name": name,
            "disk_format": ctx.config.disk_format.as_str(),
            "container_format": "bare",
            "visibility": ctx.config.visibility.as_str(),
        });
        tracing::info!("🔵 [OpenStack API] POST {} - Creating image record {}", url, name);
        let resp = self.send(&session, self.client.post(&url).json(&body)).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!("❌ [OpenStack API] POST {} failed: status={}", url, status.as_u16());
            return Err(match status {
                StatusCode::CONFLICT => ProviderError::AlreadyExists(format!("image '{}'", name)),
                _ => publish_error(status, &text),
            });
        }
        let json_resp: Value = resp.json().await.map_err(transport_error)?;
        let image_id = json_resp["id"]
            .as_str()
            .ok_or_else(|| ProviderError::PublishFailed("no image id in create response".into()))?
            .to_string();

        let transfer = match staged {
            StagedImage::Local(artifact) => self.upload_image_data(&session, &image_id, artifact).await,
            StagedImage::Object(object) => self.import_from_url(&session, &image_id, &object.url).await,
        };
        let registered = match transfer {
            Ok(()) => self.wait_for_active(&session, &image_id).await,
            Err(e) => Err(e),
        };

        match registered {
            Ok(image) => {
                tracing::info!("✅ [OpenStack API] Image {} active (id={})", name, image_id);
                Ok(image)
            }
            Err(e) => {
                // No partial registration survives a failed publish.
                if let Err(cleanup) = self.delete_image_record(&session, &image_id).await {
                    tracing::warn!(
                        "⚠️ [OpenStack API] Failed to remove image record {}: {}",
                        image_id,
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn list_images(&self, _ctx: &Context) -> Result<Vec<Image>> {
        let session = self.session()?;
        self.fetch_images(&session, None).await
    }

    async fn delete_image(&self, _ctx: &Context, name: &str) -> Result<()> {
        let session = self.session()?;
        let matches: Vec<Image> = self
            .fetch_images(&session, Some(name))
            .await?
            .into_iter()
            .filter(|i| i.name == name)
            .collect();
        if matches.is_empty() {
            tracing::debug!("[OpenStack API] delete_image: {} already absent", name);
            return Ok(());
        }
        for image in matches {
            self.delete_image_record(&session, &image.id)
                .await
                .map_err(|e| match e {
                    ProviderError::ImageInUse(_) => ProviderError::ImageInUse(name.to_string()),
                    other => other,
                })?;
        }
        tracing::info!("✅ [OpenStack API] Deleted image {}", name);
        Ok(())
    }

    async fn create_instance(&self, ctx: &Context) -> Result<Instance> {
        let session = self.session()?;
        let name = ctx.instance_name();
        if name.trim().is_empty() {
            return Err(ProviderError::InvalidArgument("instance name is empty".into()));
        }
        let Some(flavor) = ctx.run_config.flavor.as_deref() else {
            return Err(ProviderError::InvalidArgument("a flavor is required".into()));
        };

        if self.find_server(&session, name).await?.is_some() {
            return Err(ProviderError::AlreadyExists(format!("instance '{}'", name)));
        }

        let image_name = ctx.image_name();
        let image = self
            .fetch_images(&session, Some(image_name))
            .await?
            .into_iter()
            .find(|i| i.name == image_name && i.status == ImageStatus::Published)
            .ok_or_else(|| ProviderError::ImageNotFound(image_name.to_string()))?;
        let flavor_id = self.resolve_flavor(&session, flavor).await?;

        let networks = match &ctx.run_config.network {
            Some(network) => json!([{ "uuid": network }]),
            None => json!("auto"),
        };
        let body = json!({
            "server": {
                "name": name,
                "imageRef": image.id,
                "flavorRef": flavor_id,
                "networks": networks,
            }
        });

        let url = format!("{}/servers", session.compute_url.trim_end_matches('/'));
        tracing::info!(
            "🔵 [OpenStack API] POST {} - Creating server {} image={} flavor={}",
            url,
            name,
            image.id,
            flavor_id
        );
        let req = self
            .client
            .post(&url)
            .header("OpenStack-API-Version", "compute 2.37")
            .json(&body);
        let resp = self.send(&session, req).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!("❌ [OpenStack API] POST {} failed: status={}, response={}", url, status.as_u16(), text);
            return Err(match status {
                StatusCode::FORBIDDEN if text.to_ascii_lowercase().contains("quota") => {
                    ProviderError::QuotaExceeded(text)
                }
                _ => status_error(status, &text, "create server"),
            });
        }

        let json_resp: Value = resp.json().await.map_err(transport_error)?;
        let server_id = json_resp["server"]["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Io("no server id in create response".into()))?
            .to_string();
        tracing::info!("✅ [OpenStack API] Server created: id={}", server_id);

        Ok(Instance {
            id: server_id,
            name: name.to_string(),
            status: InstanceStatus::Created,
            image_id: Some(image.id),
            flavor: Some(flavor_id),
            ip_addresses: vec![],
            created_at: Some(Utc::now()),
        })
    }

    async fn list_instances(&self, _ctx: &Context) -> Result<Vec<Instance>> {
        let session = self.session()?;
        self.fetch_servers(&session).await
    }

    async fn delete_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let session = self.session()?;
        let Some(server) = self.find_server(&session, name).await? else {
            return Ok(());
        };
        let url = format!(
            "{}/servers/{}",
            session.compute_url.trim_end_matches('/'),
            server.id
        );
        tracing::info!("🔵 [OpenStack API] DELETE {}", url);
        let resp = self.send(&session, self.client.delete(&url)).await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            tracing::info!("✅ [OpenStack API] DELETE {} succeeded", url);
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(status_error(status, &text, "delete server"))
    }

    async fn start_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let session = self.session()?;
        let Some(server) = self.find_server(&session, name).await? else {
            return Err(ProviderError::InstanceNotFound(name.to_string()));
        };
        if server.status == InstanceStatus::Running {
            tracing::info!("ℹ️ [OpenStack API] Server {} already running", name);
            return Ok(());
        }

        let resp = self
            .server_action(&session, &server.id, json!({ "os-start": null }))
            .await?;
        let status = resp.status();
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::InstanceNotFound(name.to_string())),
            StatusCode::CONFLICT => Err(ProviderError::InvalidState(format!(
                "instance '{}' is {} and cannot be started",
                name, server.status
            ))),
            _ => {
                let text = resp.text().await.unwrap_or_default();
                Err(status_error(status, &text, "start server"))
            }
        }
    }

    async fn stop_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let session = self.session()?;
        let Some(server) = self.find_server(&session, name).await? else {
            return Ok(());
        };
        if server.status != InstanceStatus::Running {
            tracing::info!("ℹ️ [OpenStack API] Server {} is {} - nothing to stop", name, server.status);
            return Ok(());
        }

        let resp = self
            .server_action(&session, &server.id, json!({ "os-stop": null }))
            .await?;
        let status = resp.status();
        match status {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            StatusCode::CONFLICT => {
                // Lost a race with another state change; fine if it ended stopped.
                match self.find_server(&session, name).await? {
                    Some(s) if s.status == InstanceStatus::Running => {
                        Err(ProviderError::InvalidState(format!(
                            "instance '{}' cannot be stopped right now",
                            name
                        )))
                    }
                    _ => Ok(()),
                }
            }
            _ => {
                let text = resp.text().await.unwrap_or_default();
                Err(status_error(status, &text, "stop server"))
            }
        }
    }

    async fn get_instance_logs(
        &self,
        _ctx: &Context,
        name: &str,
        watch: bool,
    ) -> Result<InstanceLogs> {
        let session = self.session()?;
        let Some(server) = self.find_server(&session, name).await? else {
            return Err(ProviderError::InstanceNotFound(name.to_string()));
        };
        if server.status == InstanceStatus::Created {
            return Err(ProviderError::LogsNotYetAvailable(format!(
                "instance '{}' is still building",
                name
            )));
        }

        if watch {
            let client = self.client.clone();
            let server_id = server.id.clone();
            let tail = LogTail::spawn(self.log_poll_interval, move || {
                console_output(client.clone(), session.clone(), server_id.clone())
            });
            return Ok(InstanceLogs::Follow(tail));
        }
        let output = console_output(self.client.clone(), session, server.id).await?;
        Ok(InstanceLogs::Snapshot(output))
    }
}

#[async_trait]
impl ObjectStore for OpenStackProvider {
    async fn stage(&self, artifact: &Path, datastore: &Datastore) -> Result<StagedObject> {
        let session = self.session()?;
        let Some(store_url) = session.object_store_url.as_deref() else {
            return Err(ProviderError::unsupported(BACKEND_NAME, "object storage"));
        };
        let base = store_url.trim_end_matches('/');
        let container_url = format!("{}/{}", base, datastore.container);

        let resp = self.send(&session, self.client.put(&container_url)).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::StageFailed(format!(
                "create container {}: {} {}",
                datastore.container, status, text
            )));
        }

        let key = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProviderError::StageFailed(format!("bad artifact path {}", artifact.display())))?
            .to_string();
        let object_url = format!("{}/{}", container_url, key);
        let file = tokio::fs::File::open(artifact).await?;
        let size_bytes = file.metadata().await?.len();

        tracing::info!(
            "🔵 [OpenStack API] PUT {} - Staging {} bytes",
            object_url,
            size_bytes
        );
        let req = self
            .client
            .put(&object_url)
            .timeout(Duration::from_secs(3600))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Content-Length", size_bytes)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        let resp = self.send(&session, req).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::PAYLOAD_TOO_LARGE => ProviderError::QuotaExceeded(text),
                s if s.is_server_error() => ProviderError::BackendUnreachable(text),
                _ => ProviderError::StageFailed(format!("{} {}", status, text)),
            });
        }

        Ok(StagedObject {
            container: datastore.container.clone(),
            key,
            region: datastore.region.clone().or_else(|| session.region.clone()),
            url: object_url,
            size_bytes,
        })
    }
}

async fn console_output(client: Client, session: Arc<Session>, server_id: String) -> Result<String> {
    let url = format!(
        "{}/servers/{}/action",
        session.compute_url.trim_end_matches('/'),
        server_id
    );
    let resp = client
        .post(&url)
        .headers(headers(&session.token)?)
        .json(&json!({ "os-getConsoleOutput": {} }))
        .send()
        .await
        .map_err(transport_error)?;
    let status = resp.status();
    match status {
        s if s.is_success() => {
            let json_resp: Value = resp.json().await.map_err(transport_error)?;
            Ok(json_resp["output"].as_str().unwrap_or_default().to_string())
        }
        StatusCode::NOT_FOUND => Err(ProviderError::InstanceNotFound(server_id)),
        StatusCode::CONFLICT => Err(ProviderError::LogsNotYetAvailable(format!(
            "console of {} not available in its current state",
            server_id
        ))),
        _ => {
            let text = resp.text().await.unwrap_or_default();
            Err(status_error(status, &text, "console output"))
        }
    }
}

fn headers(token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "X-Auth-Token",
        HeaderValue::from_str(token)
            .map_err(|_| ProviderError::Authentication("token is not a valid header".into()))?,
    );
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("application/json"));
    Ok(headers)
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_decode() {
        ProviderError::Io(format!("unexpected response body: {}", e))
    } else {
        ProviderError::BackendUnreachable(e.to_string())
    }
}

/// Fallback mapping for statuses an operation does not handle itself.
fn status_error(status: StatusCode, body: &str, what: &str) -> ProviderError {
    let detail = format!("{} returned {}: {}", what, status.as_u16(), body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication(detail),
        StatusCode::BAD_REQUEST => ProviderError::InvalidArgument(detail),
        StatusCode::CONFLICT => ProviderError::InvalidState(detail),
        StatusCode::PAYLOAD_TOO_LARGE => ProviderError::QuotaExceeded(detail),
        s if s.is_server_error() => ProviderError::BackendUnreachable(detail),
        _ => ProviderError::BackendRejected(detail),
    }
}

fn publish_error(status: StatusCode, body: &str) -> ProviderError {
    match status {
        StatusCode::PAYLOAD_TOO_LARGE => ProviderError::QuotaExceeded(body.to_string()),
        StatusCode::UNAUTHORIZED => ProviderError::Authentication(body.to_string()),
        s if s.is_server_error() => ProviderError::BackendUnreachable(body.to_string()),
        _ => ProviderError::PublishFailed(format!("{} {}", status, body)),
    }
}

fn image_status(status: &str) -> ImageStatus {
    match status {
        "active" => ImageStatus::Published,
        "queued" | "saving" | "uploading" | "importing" => ImageStatus::Staged,
        "deleted" | "pending_delete" | "deactivated" => ImageStatus::Deleted,
        _ => ImageStatus::Failed,
    }
}

fn server_status(status: &str) -> InstanceStatus {
    match status.to_ascii_uppercase().as_str() {
        "BUILD" | "REBUILD" => InstanceStatus::Created,
        "ACTIVE" | "REBOOT" | "HARD_REBOOT" | "MIGRATING" | "RESIZE" | "VERIFY_RESIZE"
        | "PASSWORD" => InstanceStatus::Running,
        "SHUTOFF" | "STOPPED" | "SUSPENDED" | "PAUSED" | "SHELVED" | "SHELVED_OFFLOADED" => {
            InstanceStatus::Stopped
        }
        "DELETED" | "SOFT_DELETED" => InstanceStatus::Deleted,
        _ => InstanceStatus::Failed,
    }
}

// --- Wire types ---

#[derive(Deserialize)]
struct TokenReply {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogService>,
}

#[derive(Deserialize)]
struct CatalogService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    url: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
}

impl TokenReply {
    fn endpoint(&self, service_type: &str, region: Option<&str>) -> Option<String> {
        self.token
            .catalog
            .iter()
            .filter(|s| s.service_type == service_type)
            .flat_map(|s| s.endpoints.iter())
            .filter(|e| e.interface == "public")
            .find(|e| match region {
                Some(r) => e.region.as_deref() == Some(r) || e.region_id.as_deref() == Some(r),
                None => true,
            })
            .map(|e| e.url.clone())
    }
}

#[derive(Deserialize)]
struct ImagePage {
    #[serde(default)]
    images: Vec<GlanceImage>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct GlanceImage {
    id: String,
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    disk_format: Option<String>,
    #[serde(default)]
    visibility: Option<String>,
}

impl GlanceImage {
    fn into_image(self) -> Image {
        Image {
            status: image_status(&self.status),
            name: self.name.unwrap_or_default(),
            created_at: self.created_at,
            size_bytes: self.size,
            disk_format: self
                .disk_format
                .as_deref()
                .and_then(DiskFormat::parse)
                .unwrap_or_default(),
            visibility: self
                .visibility
                .as_deref()
                .and_then(Visibility::parse)
                .unwrap_or_default(),
            id: self.id,
        }
    }
}

#[derive(Deserialize)]
struct ServerPage {
    #[serde(default)]
    servers: Vec<NovaServer>,
    #[serde(default)]
    servers_links: Vec<Link>,
}

#[derive(Deserialize)]
struct Link {
    rel: String,
    href: String,
}

#[derive(Deserialize)]
struct NovaServer {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    image: Value,
    #[serde(default)]
    flavor: Value,
    #[serde(default)]
    addresses: Value,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
}

impl NovaServer {
    fn into_instance(self) -> Instance {
        // Boot-from-volume servers report `"image": ""`.
        let image_id = self.image["id"].as_str().map(|s| s.to_string());
        let flavor = self.flavor["id"]
            .as_str()
            .or_else(|| self.flavor["original_name"].as_str())
            .map(|s| s.to_string());
        let ip_addresses = self
            .addresses
            .as_object()
            .map(|nets| {
                nets.values()
                    .filter_map(|v| v.as_array())
                    .flatten()
                    .filter_map(|a| a["addr"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Instance {
            id: self.id,
            name: self.name,
            status: server_status(&self.status),
            image_id,
            flavor,
            ip_addresses,
            created_at: self.created,
        }
    }
}
