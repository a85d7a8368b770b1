use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, ListParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{Discovery, Scope, verbs};
use kube::{Client, Config};
use std::time::Duration;
use tracing::{debug, trace};

use super::{
    GatewayError, KindDescriptor, ResourceGateway, ResourceObject, ResourcePage, WatchEvent,
    WatchEventKind, WatchStream,
};

/// Timeout for connecting to the K8s API
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for reading K8s API responses. Must exceed the server-side watch
/// window below or long-lived watches get severed by our own client.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Server-side watch window in seconds (the API caps this at ~5 minutes)
const WATCH_WINDOW_SECS: u32 = 290;

/// Gateway for one cluster, backed by a kubeconfig context.
pub struct KubeGateway {
    context: String,
    client: Client,
}

impl KubeGateway {
    /// Connect using the named kubeconfig context, or the current context
    /// if none is given. No I/O happens here beyond reading the kubeconfig;
    /// the session probes liveness before anything else.
    pub async fn from_kubeconfig(context: Option<&str>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read()?;

        let context_name = context
            .map(String::from)
            .or_else(|| kubeconfig.current_context.clone())
            .ok_or_else(|| anyhow!("No context specified and no current context in kubeconfig"))?;

        if !kubeconfig.contexts.iter().any(|c| c.name == context_name) {
            return Err(anyhow!(
                "Context '{}' not found in kubeconfig",
                context_name
            ));
        }

        let mut config = Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(context_name.clone()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("Failed to load kubeconfig for context '{}'", context_name))?;

        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        let client = Client::try_from(config)
            .with_context(|| format!("Failed to create client for context '{}'", context_name))?;

        Ok(Self {
            context: context_name,
            client,
        })
    }

    /// All context names in the kubeconfig.
    pub fn list_contexts() -> Result<Vec<String>> {
        let kubeconfig = Kubeconfig::read()?;
        Ok(kubeconfig.contexts.iter().map(|c| c.name.clone()).collect())
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    fn api_resource(kind: &KindDescriptor) -> kube::api::ApiResource {
        kube::api::ApiResource {
            group: kind.group.clone(),
            version: kind.version.clone(),
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
            plural: kind.plural.clone(),
        }
    }

    /// The mirror always watches every namespace, so both namespaced and
    /// cluster-scoped kinds go through the all-namespaces handle.
    fn api_for(&self, kind: &KindDescriptor) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &Self::api_resource(kind))
    }

    fn map_error(err: kube::Error, kind: &KindDescriptor) -> GatewayError {
        match err {
            kube::Error::Api(api_err) if api_err.code == 404 => GatewayError::NotFound {
                kind: kind.kind.clone(),
                group: kind.group.clone(),
            },
            other => GatewayError::Transport(other.to_string()),
        }
    }

    fn to_resource_object(kind: &KindDescriptor, object: DynamicObject) -> ResourceObject {
        let meta = &object.metadata;
        let uid = meta.uid.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone();
        let resource_version = meta.resource_version.clone().unwrap_or_default();

        // The list API omits apiVersion/kind per item; put them back so the
        // payload is self-describing.
        let mut payload = serde_json::to_value(&object).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert(
                "apiVersion".to_string(),
                serde_json::Value::String(kind.api_version()),
            );
            map.insert(
                "kind".to_string(),
                serde_json::Value::String(kind.kind.clone()),
            );
        }

        ResourceObject {
            uid,
            kind: kind.kind.clone(),
            name,
            namespace,
            resource_version,
            payload,
        }
    }
}

#[async_trait]
impl ResourceGateway for KubeGateway {
    async fn probe(&self) -> Result<(), GatewayError> {
        self.client
            .apiserver_version()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn discover_kinds(&self) -> Result<Vec<KindDescriptor>, GatewayError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let mut kinds = Vec::new();
        for group in discovery.groups() {
            for (resource, capabilities) in group.recommended_resources() {
                if !capabilities.supports_operation(verbs::LIST) {
                    continue;
                }
                kinds.push(KindDescriptor {
                    kind: resource.kind.clone(),
                    group: resource.group.clone(),
                    version: resource.version.clone(),
                    plural: resource.plural.clone(),
                    namespaced: capabilities.scope == Scope::Namespaced,
                    watchable: capabilities.supports_operation(verbs::WATCH),
                });
            }
        }
        debug!(context = %self.context, kinds = kinds.len(), "discovered kind catalog");
        Ok(kinds)
    }

    async fn fetch_page(
        &self,
        kind: &KindDescriptor,
        limit: u32,
        token: Option<&str>,
    ) -> Result<ResourcePage, GatewayError> {
        let api = self.api_for(kind);
        let mut params = ListParams::default().limit(limit);
        if let Some(token) = token {
            params = params.continue_token(token);
        }

        let list = api
            .list(&params)
            .await
            .map_err(|e| Self::map_error(e, kind))?;

        let snapshot_marker = list.metadata.resource_version.clone().unwrap_or_default();
        let next_token = list.metadata.continue_.clone().filter(|t| !t.is_empty());
        let items: Vec<ResourceObject> = list
            .items
            .into_iter()
            .map(|object| Self::to_resource_object(kind, object))
            .collect();

        trace!(
            context = %self.context,
            kind = %kind.kind,
            group = %kind.group,
            items = items.len(),
            has_more = next_token.is_some(),
            "fetched page"
        );

        Ok(ResourcePage {
            items,
            next_token,
            snapshot_marker,
        })
    }

    async fn open_watch(
        &self,
        kind: &KindDescriptor,
        marker: &str,
    ) -> Result<WatchStream, GatewayError> {
        let api = self.api_for(kind);
        let params = WatchParams::default().timeout(WATCH_WINDOW_SECS);
        let events = api
            .watch(&params, marker)
            .await
            .map_err(|e| Self::map_error(e, kind))?;

        let kind = kind.clone();
        let stream = events.filter_map(move |event| {
            let mapped = match event {
                Ok(KubeWatchEvent::Added(object)) => Some(Ok(WatchEvent {
                    kind: WatchEventKind::Added,
                    object: Self::to_resource_object(&kind, object),
                })),
                Ok(KubeWatchEvent::Modified(object)) => Some(Ok(WatchEvent {
                    kind: WatchEventKind::Updated,
                    object: Self::to_resource_object(&kind, object),
                })),
                Ok(KubeWatchEvent::Deleted(object)) => Some(Ok(WatchEvent {
                    kind: WatchEventKind::Deleted,
                    object: Self::to_resource_object(&kind, object),
                })),
                // Bookmarks only advance the marker; nothing to merge.
                Ok(KubeWatchEvent::Bookmark(_)) => None,
                Ok(KubeWatchEvent::Error(e)) => {
                    Some(Err(GatewayError::Transport(e.to_string())))
                }
                Err(e) => Some(Err(GatewayError::Transport(e.to_string()))),
            };
            futures::future::ready(mapped)
        });

        Ok(stream.boxed())
    }
}
