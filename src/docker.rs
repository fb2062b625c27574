use crate::config::DockerConfig;
use crate::event::{Event, RegistryEvent};
use crate::image_reference::ImageReference;
use anyhow::{Context, Result};
use reqwest::{Certificate, Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static IMAGE_EVENTS_FILTER: &str = r#"{"type":["image"]}"#;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Version {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "ApiVersion", default)]
    api_version: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ImageInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
}

impl ImageInspect {
    pub fn first_repo_tag(&self) -> Option<&str> {
        self.repo_tags
            .as_deref()
            .and_then(|tags| tags.first())
            .map(String::as_str)
    }
}

/// One line of the Docker `/events` stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerEvent {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: Actor,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
}

impl DockerEvent {
    fn nanos(&self) -> i64 {
        if self.time_nano != 0 {
            self.time_nano
        } else {
            self.time.saturating_mul(1_000_000_000)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Actor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

pub trait ImageInspector: Send + Sync {
    /// Looks an image up by `name:tag` or by image id.
    fn inspect(&self, identifier: &str) -> impl Future<Output = Result<ImageInspect>> + Send;
}

pub struct DockerClient {
    http: Client,
    endpoint: String,
}

pub fn create_http_client(config: &DockerConfig) -> Result<Client> {
    info!("Initializing Docker Engine API HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder().connect_timeout(Duration::from_secs(5));

    for file_path in &config.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder
        .build()
        .context("Failed to build HTTP client")
}

impl DockerClient {
    pub async fn connect(config: &DockerConfig) -> Result<Self> {
        let client = Self {
            http: create_http_client(config)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        };
        let version: Version = client.get_json("/version").await.with_context(|| {
            format!(
                "Failed connecting to docker at {}, is docker available?",
                client.endpoint
            )
        })?;
        info!(
            "Connected to docker {} (API version {})",
            version.version, version.api_version
        );
        Ok(client)
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.endpoint, path);
        debug!("Requesting docker endpoint {}", url);
        let mut request = self.http.get(&url).query(query);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Docker returned error status {} for {}",
                response.status(),
                url
            );
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path, &[], Some(REQUEST_TIMEOUT))
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to decode docker response for {}", path))
    }

    async fn open_event_stream(&self, since: Option<i64>) -> Result<Response> {
        let mut query = vec![("filters", IMAGE_EVENTS_FILTER.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        // Long-lived stream, no request timeout.
        self.get("/events", &query, None).await
    }
}

impl ImageInspector for DockerClient {
    async fn inspect(&self, identifier: &str) -> Result<ImageInspect> {
        self.get_json(&format!("/images/{}/json", identifier)).await
    }
}

/// Maps a raw Docker event to what the reconciler cares about. Events that cannot be
/// resolved are logged and dropped.
pub async fn resolve_event<I: ImageInspector>(
    inspector: &I,
    event: &DockerEvent,
) -> Option<RegistryEvent> {
    if event.kind != "image" {
        return None;
    }
    let name = event
        .actor
        .attributes
        .get("name")
        .filter(|name| !name.is_empty());

    match event.action.as_str() {
        // Actor id is the pulled name:tag.
        "pull" => resolve_new_image(inspector, &event.actor.id).await,
        // Actor id is the image id, the new name:tag sits in the attributes.
        "tag" => {
            let Some(name) = name else {
                warn!("Ignoring tag event without name for {}", event.actor.id);
                return None;
            };
            match ImageReference::parse(name) {
                Ok(reference) => Some(RegistryEvent::NewImage {
                    reference,
                    digest: event.actor.id.clone(),
                }),
                Err(e) => {
                    warn!("Ignoring tag event for {}: {}", event.actor.id, e);
                    None
                }
            }
        }
        "load" => {
            let identifier = name.unwrap_or(&event.actor.id);
            resolve_new_image(inspector, identifier).await
        }
        "untag" | "delete" => Some(RegistryEvent::RemovedImage {
            name: name.unwrap_or(&event.actor.id).clone(),
        }),
        action => {
            debug!("Ignoring docker image action {}", action);
            None
        }
    }
}

/// Resolves whichever of name:tag and image id is missing.
async fn resolve_new_image<I: ImageInspector>(
    inspector: &I,
    identifier: &str,
) -> Option<RegistryEvent> {
    let observed = match ImageReference::parse(identifier) {
        Ok(reference) => reference,
        Err(e) => {
            warn!("Ignoring docker image event: {}", e);
            return None;
        }
    };
    let inspect = match inspector.inspect(identifier).await {
        Ok(inspect) => inspect,
        Err(e) => {
            error!("Failed to inspect new docker image {}: {:?}", identifier, e);
            return None;
        }
    };

    if observed.is_digest() {
        let Some(tag) = inspect.first_repo_tag() else {
            info!("Ignoring untagged docker image {}", identifier);
            return None;
        };
        match ImageReference::parse(tag) {
            Ok(reference) => Some(RegistryEvent::NewImage {
                reference,
                digest: observed.to_string(),
            }),
            Err(e) => {
                warn!("Ignoring docker image {}: {}", identifier, e);
                None
            }
        }
    } else {
        Some(RegistryEvent::NewImage {
            reference: observed,
            digest: inspect.id,
        })
    }
}

/// Position in the event stream. Docker's `since` filter only has second granularity,
/// so a reconnect replays the whole second of the last handled event.
#[derive(Debug, Default)]
struct StreamCursor {
    last_nanos: Option<i64>,
}

impl StreamCursor {
    fn since(&self) -> Option<i64> {
        self.last_nanos.map(|nanos| nanos.div_euclid(1_000_000_000))
    }

    /// Records `event` and returns false when it was already handled before a reconnect.
    fn advance(&mut self, event: &DockerEvent) -> bool {
        let nanos = event.nanos();
        if self.last_nanos.is_some_and(|last| nanos <= last) {
            return false;
        }
        self.last_nanos = Some(nanos);
        true
    }
}

/// Follows the Docker image event stream until cancelled, reconnecting with backoff.
pub fn spawn_image_watcher(
    client: Arc<DockerClient>,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(5));
        let mut cursor = StreamCursor::default();

        while !cancel.is_cancelled() {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = client.open_event_stream(cursor.since()) => opened,
            };
            let mut response = match opened {
                Ok(response) => {
                    backoff.reset();
                    response
                }
                Err(e) => {
                    warn!("Failed to open docker event stream, backing off: {:?}", e);
                    sleep_or_cancel(backoff.next_delay(), &cancel).await;
                    continue;
                }
            };
            info!("Listening for docker image events");

            let mut buffer: Vec<u8> = Vec::with_capacity(8 * 1024);
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = response.chunk() => chunk,
                };
                match chunk {
                    Ok(Some(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                        for line in drain_lines(&mut buffer) {
                            let event: DockerEvent = match serde_json::from_slice(&line) {
                                Ok(event) => event,
                                Err(e) => {
                                    warn!("Ignoring malformed docker event: {}", e);
                                    continue;
                                }
                            };
                            if !cursor.advance(&event) {
                                debug!("Skipping replayed docker event {}", event.action);
                                continue;
                            }
                            if let Some(event) = resolve_event(client.as_ref(), &event).await {
                                if tx.send(event.into()).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("Docker event stream closed, reconnecting");
                        break;
                    }
                    Err(e) => {
                        warn!("Docker event stream error, reconnecting: {}", e);
                        break;
                    }
                }
            }

            sleep_or_cancel(backoff.next_delay(), &cancel).await;
        }
    })
}

/// Removes and returns every complete, non-blank line, keeping a trailing partial line.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let trimmed = line.trim_ascii();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_vec());
        }
    }
    lines
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = sleep(d) => {}
        _ = cancel.cancelled() => {}
    }
}

struct Backoff {
    cur: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { cur: min, min, max }
    }

    fn reset(&mut self) {
        self.cur = self.min;
    }

    fn next_delay(&mut self) -> Duration {
        let d = self.cur;
        self.cur = std::cmp::min(self.cur * 2, self.max);
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static ALPINE_ID: &str =
        "sha256:f8c20f8bbcb684055b4fea470fdd169c86e87786940b3262335b12ec3adef418";

    #[derive(Default)]
    struct FakeInspector {
        images: HashMap<String, ImageInspect>,
    }

    impl FakeInspector {
        fn with_alpine() -> Self {
            let inspect = ImageInspect {
                id: ALPINE_ID.to_string(),
                repo_tags: Some(vec!["alpine:3.10".to_string()]),
            };
            let mut images = HashMap::new();
            images.insert("alpine:3.10".to_string(), inspect.clone());
            images.insert(ALPINE_ID.to_string(), inspect);
            Self { images }
        }
    }

    impl ImageInspector for FakeInspector {
        async fn inspect(&self, identifier: &str) -> Result<ImageInspect> {
            self.images
                .get(identifier)
                .cloned()
                .with_context(|| format!("No such image: {}", identifier))
        }
    }

    fn event(json: &str) -> DockerEvent {
        serde_json::from_str(json).expect("valid docker event")
    }

    #[tokio::test]
    async fn test_pull_event_resolves_digest() {
        let pull = event(
            r#"{"status":"pull","id":"alpine:3.10","Type":"image","Action":"pull","Actor":{"ID":"alpine:3.10","Attributes":{"name":"alpine"}},"scope":"local","time":1708196718,"timeNano":1708196718436679144}"#,
        );

        let resolved = resolve_event(&FakeInspector::with_alpine(), &pull).await;

        assert_eq!(
            resolved,
            Some(RegistryEvent::NewImage {
                reference: ImageReference::parse("alpine:3.10").unwrap(),
                digest: ALPINE_ID.to_string(),
            })
        );
        assert_eq!(pull.time, 1708196718);
    }

    #[tokio::test]
    async fn test_tag_event_uses_name_attribute() {
        let tag = event(&format!(
            r#"{{"Type":"image","Action":"tag","Actor":{{"ID":"{ALPINE_ID}","Attributes":{{"name":"alpine-test:latest"}}}},"time":1708197072}}"#
        ));

        let resolved = resolve_event(&FakeInspector::default(), &tag).await;

        assert_eq!(
            resolved,
            Some(RegistryEvent::NewImage {
                reference: ImageReference::parse("alpine-test:latest").unwrap(),
                digest: ALPINE_ID.to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_load_event_by_id_resolves_name() {
        let load = event(&format!(
            r#"{{"Type":"image","Action":"load","Actor":{{"ID":"{ALPINE_ID}"}},"time":1}}"#
        ));

        let resolved = resolve_event(&FakeInspector::with_alpine(), &load).await;

        assert_eq!(
            resolved,
            Some(RegistryEvent::NewImage {
                reference: ImageReference::parse("alpine:3.10").unwrap(),
                digest: ALPINE_ID.to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_failed_inspection_drops_event() {
        let pull = event(
            r#"{"Type":"image","Action":"pull","Actor":{"ID":"missing:1.0"},"time":1}"#,
        );

        assert!(resolve_event(&FakeInspector::default(), &pull).await.is_none());
    }

    #[tokio::test]
    async fn test_untagged_image_is_dropped() {
        let mut inspector = FakeInspector::default();
        inspector.images.insert(
            ALPINE_ID.to_string(),
            ImageInspect {
                id: ALPINE_ID.to_string(),
                repo_tags: None,
            },
        );
        let load = event(&format!(
            r#"{{"Type":"image","Action":"load","Actor":{{"ID":"{ALPINE_ID}"}}}}"#
        ));

        assert!(resolve_event(&inspector, &load).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_event_reports_removed_image() {
        let delete = event(&format!(
            r#"{{"Type":"image","Action":"delete","Actor":{{"ID":"{ALPINE_ID}","Attributes":{{"name":"alpine:3.10"}}}}}}"#
        ));

        assert_eq!(
            resolve_event(&FakeInspector::default(), &delete).await,
            Some(RegistryEvent::RemovedImage {
                name: "alpine:3.10".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let container = event(r#"{"Type":"container","Action":"start","Actor":{"ID":"abc"}}"#);
        let push = event(r#"{"Type":"image","Action":"push","Actor":{"ID":"alpine:3.10"}}"#);

        let inspector = FakeInspector::with_alpine();
        assert!(resolve_event(&inspector, &container).await.is_none());
        assert!(resolve_event(&inspector, &push).await.is_none());
    }

    #[test]
    fn test_image_inspect_accepts_null_repo_tags() {
        let inspect: ImageInspect =
            serde_json::from_str(r#"{"Id":"sha256:abc","RepoTags":null}"#).unwrap();
        assert_eq!(inspect.first_repo_tag(), None);
    }

    #[test]
    fn test_drain_lines_keeps_partial_line() {
        let mut buffer = b"{\"a\":1}\n\n{\"b\":2}\r\n{\"c\"".to_vec();

        let lines = drain_lines(&mut buffer);

        assert_eq!(lines, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        assert_eq!(buffer, b"{\"c\"".to_vec());
    }

    #[test]
    fn test_cursor_skips_same_second_replay() {
        let v2 = event(
            r#"{"Type":"image","Action":"tag","time":1708197072,"timeNano":1708197072100000000}"#,
        );
        let v3 = event(
            r#"{"Type":"image","Action":"tag","time":1708197072,"timeNano":1708197072900000000}"#,
        );
        let mut cursor = StreamCursor::default();
        assert_eq!(cursor.since(), None);

        assert!(cursor.advance(&v2));
        assert!(cursor.advance(&v3));
        assert_eq!(cursor.since(), Some(1708197072));

        // Reconnect from the same second replays both tags.
        assert!(!cursor.advance(&v2));
        assert!(!cursor.advance(&v3));

        let v4 = event(
            r#"{"Type":"image","Action":"tag","time":1708197073,"timeNano":1708197073000000001}"#,
        );
        assert!(cursor.advance(&v4));
        assert_eq!(cursor.since(), Some(1708197073));
    }

    #[test]
    fn test_cursor_falls_back_to_seconds() {
        let old = event(r#"{"Type":"image","Action":"pull","time":10}"#);
        let new = event(r#"{"Type":"image","Action":"pull","time":11}"#);
        let mut cursor = StreamCursor::default();

        assert!(cursor.advance(&old));
        assert!(cursor.advance(&new));
        assert!(!cursor.advance(&old));
        assert_eq!(cursor.since(), Some(11));
    }

    #[tokio::test]
    async fn test_image_watcher_stops_while_waiting_for_headers() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let client = Arc::new(DockerClient {
            http: Client::new(),
            endpoint: format!("http://{}", addr),
        });
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let watcher = spawn_image_watcher(client, tx, cancel.clone());
        sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), watcher)
            .await
            .expect("watcher should stop on cancel")
            .unwrap();
        silent.abort();
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }
}
