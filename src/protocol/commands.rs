//! Typed commands layered on [`ControlClient::call`].

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::models::{Component, ComponentControls, ComponentList};
use crate::protocol::client::ControlClient;
use crate::protocol::error::ControlError;

/// Remote method names.
pub mod methods {
    pub const LOGON: &str = "Logon";
    pub const GET_COMPONENTS: &str = "Component.GetComponents";
    pub const COMPONENT_GET: &str = "Component.Get";
    pub const COMPONENT_SET: &str = "Component.Set";
}

/// Component operations used by deployment.
///
/// This trait abstracts the control client to enable:
/// - Dependency injection for testing with mock implementations
/// - Validating deployments without a live control server
#[allow(async_fn_in_trait)]
pub trait ControlService {
    /// Enumerate components in server order.
    async fn list_components(&self) -> Result<Vec<Component>, ControlError>;

    /// Read one control value; `None` if the control is absent.
    async fn read_control_value(
        &self,
        component: &str,
        control: &str,
    ) -> Result<Option<Value>, ControlError>;

    /// Write one control value.
    async fn write_control_value(
        &self,
        component: &str,
        control: &str,
        value: Value,
    ) -> Result<(), ControlError>;
}

impl ControlClient {
    /// Log on with the given credentials.
    ///
    /// # Errors
    ///
    /// Any failure, transport or remote, is wrapped in
    /// `ControlError::Authentication`. There is no retry.
    pub async fn authenticate(&self, user: &str, password: &str) -> Result<(), ControlError> {
        debug!("Logging on as {}", user);
        self.call(methods::LOGON, json!({"User": user, "Password": password}))
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!("Logon as {} failed: {}", user, e);
                ControlError::Authentication(Box::new(e))
            })
    }

    /// Enumerate components.
    ///
    /// Both a bare array and `{"Components": [...]}` are accepted; any other
    /// result shape yields an empty list.
    pub async fn list_components(&self) -> Result<Vec<Component>, ControlError> {
        let result = self.call(methods::GET_COMPONENTS, json!({})).await?;
        let components = ComponentList::from_result(result);
        debug!("Server reported {} component(s)", components.len());
        Ok(components)
    }

    /// Read the current value of `component`.`control`.
    ///
    /// Returns `Ok(None)` when the response does not contain the control.
    pub async fn read_control_value(
        &self,
        component: &str,
        control: &str,
    ) -> Result<Option<Value>, ControlError> {
        let result = self
            .call(
                methods::COMPONENT_GET,
                json!({"Name": component, "Controls": [control]}),
            )
            .await?;

        let controls = match serde_json::from_value::<ComponentControls>(result) {
            Ok(controls) => controls,
            Err(e) => {
                warn!("Unrecognized Component.Get result for {}: {}", component, e);
                return Ok(None);
            }
        };

        let state = controls.take(control);
        if state.is_none() {
            debug!("Control {}.{} not present in response", component, control);
        }
        Ok(state.map(|s| s.into_value()))
    }

    /// Set `component`.`control` to `value`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Remote` if the server rejects the write.
    pub async fn write_control_value(
        &self,
        component: &str,
        control: &str,
        value: Value,
    ) -> Result<(), ControlError> {
        self.call(
            methods::COMPONENT_SET,
            json!({
                "Name": component,
                "Controls": [{"Name": control, "Value": value}]
            }),
        )
        .await
        .map(|_| ())
    }
}

/// Implementation of `ControlService` for `ControlClient`.
///
/// The trait methods delegate to the inherent methods.
impl ControlService for ControlClient {
    async fn list_components(&self) -> Result<Vec<Component>, ControlError> {
        ControlClient::list_components(self).await
    }

    async fn read_control_value(
        &self,
        component: &str,
        control: &str,
    ) -> Result<Option<Value>, ControlError> {
        ControlClient::read_control_value(self, component, control).await
    }

    async fn write_control_value(
        &self,
        component: &str,
        control: &str,
        value: Value,
    ) -> Result<(), ControlError> {
        ControlClient::write_control_value(self, component, control, value).await
    }
}
