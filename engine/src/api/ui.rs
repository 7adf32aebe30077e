//! `ui` namespace: requests forwarded to the host UI as bus events

use crate::message_bus::{Event, MessageBus};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::host_api::{args, NamespaceImpl};
use serde_json::{json, Value};
use std::sync::Arc;

/// Publishes `UiRequest` events
pub struct UiApi {
    bus: Arc<MessageBus>,
}

impl UiApi {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

/// Build the payload of a UI method, or fail for unknown methods
fn payload(method: &str, args: &[Value]) -> Result<Value, EngineError> {
    let payload = match method {
        "showNotification" => json!({
            "message": args::string(args, 0, "message")?,
            "level": args::opt_string(args, 1).unwrap_or_else(|| "info".to_string()),
        }),
        "showModal" => json!({
            "title": args::string(args, 0, "title")?,
            "content": args::value(args, 1),
        }),
        "registerMenuItem" | "registerToolbarButton" => json!({
            "id": args::string(args, 0, "id")?,
            "label": args::string(args, 1, "label")?,
        }),
        "registerPanel" => json!({
            "id": args::string(args, 0, "id")?,
            "title": args::string(args, 1, "title")?,
        }),
        other => {
            return Err(EngineError::Execution(format!(
                "Unknown ui method: {}",
                other
            )))
        }
    };
    Ok(payload)
}

#[async_trait]
impl NamespaceImpl for UiApi {
    async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        let payload = payload(method, &args)?;
        self.bus
            .publish(Event::UiRequest {
                plugin_id: plugin_id.to_string(),
                action: method.to_string(),
                payload,
            })
            .await;
        Ok(Value::Bool(true))
    }
}

/// Stand-in for plugins without `ui`: accepts the same calls, shows nothing
pub struct InertUi;

#[async_trait]
impl NamespaceImpl for InertUi {
    async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        payload(method, &args)?;
        tracing::debug!("Ignoring ui.{} from {} (ui not granted)", method, plugin_id);
        Ok(Value::Bool(false))
    }
}
