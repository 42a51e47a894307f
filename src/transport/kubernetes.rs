//! Kubernetes transport — raw resource watch
//!
//! Each connection is one watch request against the API server. Watch
//! streams are routinely closed by the server (timeouts, apiserver
//! restarts, 410 Gone when the resource version ages out), so this
//! transport leans on the feed driver for its reconnect story: stream
//! end and 410 are retriable, and the resource-version cursor carries
//! across replacement connections so a reconnect resumes where the
//! previous watch left off.

use crate::error::{FeedError, Result};
use crate::transport::{Connection, Connector, FailureClass, Received};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// What happened to the watched resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceAction {
    Added,
    Modified,
    Deleted,
}

/// A decoded watch notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEvent<K> {
    pub action: ResourceAction,
    pub object: K,
}

/// Kubernetes watch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeWatchConfig {
    /// Namespace to watch (`None` = all namespaces)
    pub namespace: Option<String>,

    /// Label selector for filtering
    pub label_selector: Option<String>,

    /// Field selector for filtering
    pub field_selector: Option<String>,
}

impl KubeWatchConfig {
    /// Watch a specific namespace
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Filter by labels
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Filter by fields
    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }
}

/// Connector that watches one namespaced Kubernetes resource type
///
/// The client is built lazily on the first connect and reused; each
/// connect issues a fresh watch request resuming at the last observed
/// resource version. `namespace: None` watches the resource across all
/// namespaces.
pub struct KubeConnector<K> {
    config: KubeWatchConfig,
    client: Option<Client>,
    // last observed resourceVersion, shared with live connections so a
    // replacement watch resumes instead of replaying
    cursor: Arc<Mutex<String>>,
    _marker: std::marker::PhantomData<fn() -> K>,
}

impl<K> KubeConnector<K> {
    pub fn new(config: KubeWatchConfig) -> Self {
        Self {
            config,
            client: None,
            cursor: Arc::new(Mutex::new("0".to_string())),
            _marker: std::marker::PhantomData,
        }
    }

    /// Use an already-built client instead of in-cluster/kubeconfig discovery
    pub fn with_client(config: KubeWatchConfig, client: Client) -> Self {
        Self {
            client: Some(client),
            ..Self::new(config)
        }
    }
}

#[async_trait]
impl<K> Connector for KubeConnector<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    type Event = ResourceEvent<K>;
    type Conn = KubeWatchConnection<K>;

    async fn connect(&mut self) -> Result<Self::Conn> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let client = Client::try_default().await.map_err(|e| {
                    FeedError::ConnectionLost {
                        transport: "kubernetes".to_string(),
                        reason: format!("client init: {}", e),
                    }
                })?;
                self.client = Some(client.clone());
                client
            }
        };

        let api: Api<K> = match &self.config.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };

        let mut params = WatchParams::default();
        if let Some(ref labels) = self.config.label_selector {
            params = params.labels(labels);
        }
        if let Some(ref fields) = self.config.field_selector {
            params = params.fields(fields);
        }

        let version = lock_cursor(&self.cursor).clone();
        let stream = api
            .watch(&params, &version)
            .await
            .map_err(|e| FeedError::Subscribe {
                transport: "kubernetes".to_string(),
                reason: format!("watch request failed: {}", e),
            })?;

        tracing::info!(
            namespace = ?self.config.namespace,
            labels = ?self.config.label_selector,
            resource_version = %version,
            "Kubernetes watch established"
        );

        Ok(KubeWatchConnection {
            stream: stream.boxed(),
            cursor: Arc::clone(&self.cursor),
            ended: false,
        })
    }

    fn decode(&self, frame: WatchEvent<K>) -> Result<Option<ResourceEvent<K>>> {
        Ok(match frame {
            WatchEvent::Added(object) => Some(ResourceEvent {
                action: ResourceAction::Added,
                object,
            }),
            WatchEvent::Modified(object) => Some(ResourceEvent {
                action: ResourceAction::Modified,
                object,
            }),
            WatchEvent::Deleted(object) => Some(ResourceEvent {
                action: ResourceAction::Deleted,
                object,
            }),
            // bookmarks only advance the cursor, which recv already did
            WatchEvent::Bookmark(_) => None,
            // in-stream errors are turned into Err by recv
            WatchEvent::Error(_) => None,
        })
    }

    fn classify(&self, error: &FeedError) -> FailureClass {
        classify(error)
    }

    fn name(&self) -> &str {
        "kubernetes"
    }
}

/// One open watch request
pub struct KubeWatchConnection<K> {
    stream: BoxStream<'static, kube::Result<WatchEvent<K>>>,
    cursor: Arc<Mutex<String>>,
    ended: bool,
}

#[async_trait]
impl<K> Connection for KubeWatchConnection<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    type Frame = WatchEvent<K>;

    async fn recv(&mut self) -> Result<Received<WatchEvent<K>>> {
        match self.stream.next().await {
            Some(Ok(event)) => {
                match &event {
                    WatchEvent::Added(obj)
                    | WatchEvent::Modified(obj)
                    | WatchEvent::Deleted(obj) => {
                        if let Some(version) = obj.resource_version() {
                            *lock_cursor(&self.cursor) = version;
                        }
                    }
                    WatchEvent::Bookmark(bookmark) => {
                        *lock_cursor(&self.cursor) =
                            bookmark.metadata.resource_version.clone();
                    }
                    WatchEvent::Error(status) => {
                        self.ended = true;
                        if status.code == 410 {
                            // resource version expired; restart from the
                            // current state on the next watch
                            *lock_cursor(&self.cursor) = "0".to_string();
                            return Err(FeedError::StreamClosed {
                                transport: "kubernetes".to_string(),
                                reason: format!("resource version expired: {}", status.message),
                            });
                        }
                        return Err(FeedError::Protocol {
                            transport: "kubernetes".to_string(),
                            reason: format!(
                                "watch error {} ({}): {}",
                                status.code, status.reason, status.message
                            ),
                        });
                    }
                }
                Ok(Received::Frame(event))
            }
            Some(Err(err)) => {
                self.ended = true;
                Err(FeedError::StreamClosed {
                    transport: "kubernetes".to_string(),
                    reason: format!("watch stream failed: {}", err),
                })
            }
            None => {
                self.ended = true;
                Err(FeedError::StreamClosed {
                    transport: "kubernetes".to_string(),
                    reason: "watch stream ended".to_string(),
                })
            }
        }
    }

    fn is_live(&self) -> bool {
        !self.ended
    }
}

/// Failure classification for the Kubernetes transport
///
/// The API server closes watches as a matter of course, so closed
/// streams and failed watch requests are retriable. Protocol errors
/// other than 410 are not.
pub fn classify(error: &FeedError) -> FailureClass {
    match error {
        FeedError::StreamClosed { .. } | FeedError::Subscribe { .. } => FailureClass::Retriable,
        _ => FailureClass::Fatal,
    }
}

fn lock_cursor(cursor: &Mutex<String>) -> std::sync::MutexGuard<'_, String> {
    cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    #[test]
    fn test_config_builder() {
        let config = KubeWatchConfig::default()
            .namespace("workers")
            .labels("app=ingest")
            .fields("status.phase=Running");

        assert_eq!(config.namespace.as_deref(), Some("workers"));
        assert_eq!(config.label_selector.as_deref(), Some("app=ingest"));
        assert_eq!(config.field_selector.as_deref(), Some("status.phase=Running"));
    }

    #[test]
    fn test_decode_maps_watch_events() {
        let connector = KubeConnector::<Pod>::new(KubeWatchConfig::default());
        let pod = Pod::default();

        let decoded = connector
            .decode(WatchEvent::Added(pod.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(decoded.action, ResourceAction::Added);

        let decoded = connector.decode(WatchEvent::Deleted(pod)).unwrap().unwrap();
        assert_eq!(decoded.action, ResourceAction::Deleted);
    }

    #[test]
    fn test_classify_stream_closed_is_retriable() {
        let err = FeedError::StreamClosed {
            transport: "kubernetes".to_string(),
            reason: "watch stream ended".to_string(),
        };
        assert_eq!(classify(&err), FailureClass::Retriable);

        let err = FeedError::Protocol {
            transport: "kubernetes".to_string(),
            reason: "watch error 403".to_string(),
        };
        assert_eq!(classify(&err), FailureClass::Fatal);
    }

    #[test]
    fn test_cursor_starts_at_zero() {
        let connector = KubeConnector::<Pod>::new(KubeWatchConfig::default());
        assert_eq!(*lock_cursor(&connector.cursor), "0");
    }
}
