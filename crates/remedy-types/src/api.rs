//! Request and response bodies of the HTTP surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::error::{Result, TypesError};
use crate::resource::Target;
use crate::run::{Run, RunAction};
use crate::Timestamp;

/// Body of `POST /playbook/run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Playbook id.
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub component_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub check_id: Option<Uuid>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl RunRequest {
    pub fn new(playbook_id: Uuid) -> Self {
        Self {
            id: playbook_id,
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// The requested target. At most one of the three ids may be set.
    pub fn target(&self) -> Result<Option<Target>> {
        let targets: Vec<Target> = [
            self.config_id.map(Target::config),
            self.component_id.map(Target::component),
            self.check_id.map(Target::check),
        ]
        .into_iter()
        .flatten()
        .collect();
        match targets.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            _ => Err(TypesError::InvalidRequest(
                "at most one of config_id, component_id, check_id may be set".into(),
            )),
        }
    }
}

/// Response of `POST /playbook/run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCreated {
    pub run_id: Uuid,
    pub starts_at: Timestamp,
}

/// Response of `GET /playbook/run/:id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    #[serde(default)]
    pub actions: Vec<RunAction>,
}

/// Response of `GET /playbook/run/:id/actions/:action_id/artifacts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactList {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::TargetKind;

    #[test]
    fn test_target_is_exclusive() {
        let mut req = RunRequest::new(Uuid::new_v4());
        assert!(req.target().unwrap().is_none());

        let id = Uuid::new_v4();
        req.component_id = Some(id);
        let target = req.target().unwrap().unwrap();
        assert_eq!(target.kind, TargetKind::Component);
        assert_eq!(target.id, id);

        req.check_id = Some(Uuid::new_v4());
        assert!(req.target().is_err());
    }

    #[test]
    fn test_params_default_to_empty() {
        let req: RunRequest =
            serde_json::from_str(r#"{"id": "11111111-1111-1111-1111-111111111111"}"#).unwrap();
        assert!(req.params.is_empty());
        assert!(req.config_id.is_none());
    }
}
