//! Script deployment with component validation.
//!
//! Before anything is written the target component is looked up in the
//! server's component list (by name, then by ID) and its type is checked
//! against [`DEPLOYABLE_COMPONENT_TYPES`](crate::models::DEPLOYABLE_COMPONENT_TYPES).
//! A missing component and a component of the wrong type are reported as
//! different errors, and neither issues a write.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ScriptMapping;
use crate::models::{find_component, Component};
use crate::protocol::{ControlError, ControlService};

/// Deployment failures.
#[derive(Debug, Error)]
pub enum DeployError {
    /// No component matched by name or ID.
    #[error("Component '{0}' not found on the control server")]
    ComponentNotFound(String),

    /// The component exists but does not accept scripts.
    #[error("Component '{name}' has type '{component_type}', which does not accept scripts")]
    UnsupportedComponentType {
        name: String,
        component_type: String,
    },

    /// The script file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The control server call failed.
    #[error(transparent)]
    Control(#[from] ControlError),
}

impl DeployError {
    /// True when the deployment was refused before any write.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DeployError::ComponentNotFound(_) | DeployError::UnsupportedComponentType { .. }
        )
    }
}

/// Outcome of a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    /// Name of the component written to.
    pub component: String,
    /// Control that received the value.
    pub control: String,
    /// Size of the deployed text, when a file was deployed.
    pub bytes: usize,
}

/// Resolve `target` in `components` and check it accepts scripts.
pub fn validate_target<'a>(
    components: &'a [Component],
    target: &str,
) -> Result<&'a Component, DeployError> {
    let component = find_component(components, target)
        .ok_or_else(|| DeployError::ComponentNotFound(target.to_string()))?;

    if !component.is_deployable() {
        return Err(DeployError::UnsupportedComponentType {
            name: component.name.clone(),
            component_type: component.component_type.clone(),
        });
    }

    Ok(component)
}

/// Validate `target` and write `value` to its `control`.
///
/// The write is addressed to the matched component's name, so a target
/// given by ID is resolved first.
pub async fn deploy_value<S: ControlService>(
    service: &S,
    target: &str,
    control: &str,
    value: Value,
) -> Result<DeployReport, DeployError> {
    let components = service.list_components().await?;

    let component = match validate_target(&components, target) {
        Ok(component) => component,
        Err(e) => {
            warn!("Refusing to deploy to {}: {}", target, e);
            return Err(e);
        }
    };

    service
        .write_control_value(&component.name, control, value)
        .await?;

    info!("Deployed to {}.{}", component.name, control);
    Ok(DeployReport {
        component: component.name.clone(),
        control: control.to_string(),
        bytes: 0,
    })
}

/// Deploy the file named by `mapping` (relative paths resolve against
/// `base_dir`) to the mapped component and control.
pub async fn deploy_file<S: ControlService>(
    service: &S,
    mapping: &ScriptMapping,
    base_dir: &Path,
) -> Result<DeployReport, DeployError> {
    let path = base_dir.join(&mapping.file);
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| DeployError::ReadFile {
            path: path.clone(),
            source,
        })?;
    let bytes = text.len();

    info!(
        "Deploying {} ({} bytes) to {}.{}",
        path.display(),
        bytes,
        mapping.component,
        mapping.control
    );

    let report = deploy_value(
        service,
        &mapping.component,
        &mapping.control,
        Value::String(text),
    )
    .await?;

    Ok(DeployReport { bytes, ..report })
}
