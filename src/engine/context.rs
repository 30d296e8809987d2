use super::store::Artifacts;
use super::Phase;
use crate::config::Config;
use crate::host::{Distro, Host};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;

/// Everything a step sees while it runs: prior artifacts plus collaborator handles.
pub struct StepContext<'a> {
    pub phase: Phase,
    pub step: &'a str,
    pub artifacts: &'a Artifacts,
    pub host: &'a Host,
}

impl<'a> StepContext<'a> {
    pub fn distro(&self) -> Distro {
        self.host.distro
    }

    pub fn config(&self) -> &'a Config {
        &self.host.config
    }

    /// Decode a required artifact produced by an earlier step.
    pub fn artifact<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .artifacts
            .get(key)
            .ok_or_else(|| anyhow!("artifact `{key}` is missing from the progress record"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("decode artifact `{key}`"))
    }

    pub fn artifact_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.artifacts.get(key) {
            Some(_) => self.artifact(key).map(Some),
            None => Ok(None),
        }
    }
}
