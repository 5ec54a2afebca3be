//! Hooks called by the streaming server when a camera publishes or stops.
//!
//! Every reply allows the stream unless the camera is unknown or disabled.
//! Recording trouble is logged and never blocks live video.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::CallbacksSection;
use crate::recorder::{RecordingOrchestrator, RecordingSource};
use crate::registry::{CameraRecord, CameraRegistry, Protocol, RegistryResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PublishNotification {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub vhost: Option<String>,
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub stream: String,
}

impl PublishNotification {
    /// `slug/name` split of the stream path.
    pub fn stream_parts(&self) -> Option<(&str, &str)> {
        let mut parts = self.stream.split('/');
        let slug = parts.next().filter(|slug| !slug.is_empty())?;
        let name = parts.next().filter(|name| !name.is_empty())?;
        Some((slug, name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackReply {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl CallbackReply {
    pub fn allow() -> Self {
        Self { code: 0, msg: None }
    }

    pub fn reject(msg: impl Into<String>) -> Self {
        Self {
            code: 1,
            msg: Some(msg.into()),
        }
    }

    pub fn allowed(&self) -> bool {
        self.code == 0
    }
}

pub struct PublishCallbacks {
    orchestrator: Arc<RecordingOrchestrator>,
    registry: Arc<dyn CameraRegistry>,
    source_base: String,
}

impl fmt::Debug for PublishCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishCallbacks")
            .field("source_base", &self.source_base)
            .finish()
    }
}

enum Lookup {
    Found(CameraRecord),
    Rejected(&'static str),
}

impl PublishCallbacks {
    pub fn new(
        orchestrator: Arc<RecordingOrchestrator>,
        registry: Arc<dyn CameraRegistry>,
        config: &CallbacksSection,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            source_base: config.publish_source_base.trim_end_matches('/').to_string(),
        }
    }

    /// Routes a raw JSON payload by its `action` field. Unreadable payloads
    /// are allowed through.
    pub async fn dispatch(&self, payload: &str) -> CallbackReply {
        let notification: PublishNotification = match serde_json::from_str(payload) {
            Ok(notification) => notification,
            Err(err) => {
                warn!(error = %err, "unreadable callback payload");
                return CallbackReply::allow();
            }
        };
        match notification.action.as_str() {
            "on_publish" => self.on_publish(&notification).await,
            "on_unpublish" => self.on_unpublish(&notification).await,
            _ => self.on_connect(&notification),
        }
    }

    pub fn on_connect(&self, notification: &PublishNotification) -> CallbackReply {
        info!(ip = notification.ip.as_deref().unwrap_or("unknown"), "stream client connected");
        CallbackReply::allow()
    }

    pub async fn on_publish(&self, notification: &PublishNotification) -> CallbackReply {
        info!(
            stream = %notification.stream,
            ip = notification.ip.as_deref().unwrap_or("unknown"),
            "stream published"
        );
        let camera = match self.lookup(notification) {
            Ok(Lookup::Found(camera)) => camera,
            Ok(Lookup::Rejected(reason)) => {
                warn!(stream = %notification.stream, reason, "publish rejected");
                return CallbackReply::reject(reason);
            }
            Err(err) => {
                error!(stream = %notification.stream, error = %err, "registry lookup failed");
                return CallbackReply::allow();
            }
        };
        if !camera.active {
            warn!(stream = %notification.stream, "publish rejected, camera inactive");
            return CallbackReply::reject("Camera inactive");
        }

        let source = RecordingSource {
            url: format!("{}/{}", self.source_base, notification.stream),
            protocol: Protocol::Rtmp,
            transcode: camera.transcode,
            publish_target: None,
        };
        match self
            .orchestrator
            .start_camera_recording(&camera.id, &camera.client_slug, &camera.name, source)
            .await
        {
            Ok(outcome) => {
                info!(camera_id = %camera.id, pid = outcome.pid(), "recording follows publish");
            }
            Err(err) => {
                error!(camera_id = %camera.id, error = %err, "recording failed to start, stream allowed");
            }
        }
        CallbackReply::allow()
    }

    pub async fn on_unpublish(&self, notification: &PublishNotification) -> CallbackReply {
        info!(stream = %notification.stream, "stream unpublished");
        match self.lookup(notification) {
            Ok(Lookup::Found(camera)) => {
                if let Err(err) = self.orchestrator.stop_camera_recording(&camera.id).await {
                    error!(camera_id = %camera.id, error = %err, "failed to stop recording");
                }
            }
            Ok(Lookup::Rejected(_)) => {}
            Err(err) => {
                error!(stream = %notification.stream, error = %err, "registry lookup failed");
            }
        }
        CallbackReply::allow()
    }

    fn lookup(&self, notification: &PublishNotification) -> RegistryResult<Lookup> {
        let Some((slug, name)) = notification.stream_parts() else {
            return Ok(Lookup::Rejected("Invalid stream path"));
        };
        let Some(client) = self.registry.client_by_slug(slug)? else {
            return Ok(Lookup::Rejected("Client not found"));
        };
        Ok(match self.registry.camera_by_name(&client.id, name)? {
            Some(camera) => Lookup::Found(camera),
            None => Lookup::Rejected("Camera not found"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_parts_need_slug_and_name() {
        let mut notification = PublishNotification {
            stream: "acme/cam1".into(),
            ..PublishNotification::default()
        };
        assert_eq!(notification.stream_parts(), Some(("acme", "cam1")));
        notification.stream = "acme".into();
        assert_eq!(notification.stream_parts(), None);
        notification.stream = "/cam1".into();
        assert_eq!(notification.stream_parts(), None);
    }

    #[test]
    fn payload_fields_are_optional() {
        let notification: PublishNotification =
            serde_json::from_str(r#"{"action":"on_publish","client_id":7,"stream":"acme/cam1"}"#)
                .unwrap();
        assert_eq!(notification.action, "on_publish");
        assert!(notification.ip.is_none());
        let reply = serde_json::to_value(CallbackReply::allow()).unwrap();
        assert_eq!(reply, serde_json::json!({"code": 0}));
    }
}
