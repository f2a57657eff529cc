//! Program spec loading.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::error::AppError;
use crate::models::{ApplicationSpec, Program, ProgramId, StageSpec};

/// A source of program specs.
#[async_trait]
pub trait SpecLoader: Send + Sync + 'static {
    /// Load the given program along with the application which declares it.
    async fn load(&self, program: &ProgramId) -> Result<Program>;

    /// Load the stages of the given flow program.
    async fn stages(&self, program: &ProgramId) -> Result<Vec<StageSpec>> {
        let program = self.load(program).await?;
        program
            .stages()
            .map(|stages| stages.to_vec())
            .ok_or_else(|| AppError::InvalidInput(format!("program {} declares no stages", program.id)).into())
    }
}

/// A spec loader serving a single application spec read from a YAML file.
pub struct FileSpecLoader {
    application: Arc<ApplicationSpec>,
}

impl FileSpecLoader {
    /// Read the application spec at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("error reading application spec file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("error loading application spec file {}", path.display()))
    }

    /// Parse an application spec from YAML.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let application: ApplicationSpec = serde_yaml::from_str(raw).context("error decoding application spec")?;
        for flow in application.flows.iter() {
            flow.validate()?;
        }
        Ok(Self {
            application: Arc::new(application),
        })
    }
}

#[async_trait]
impl SpecLoader for FileSpecLoader {
    async fn load(&self, program: &ProgramId) -> Result<Program> {
        if program.namespace != self.application.namespace || program.application != self.application.name {
            return Err(AppError::InvalidInput(format!("application {}.{} is not deployed", program.namespace, program.application)).into());
        }
        Ok(Program {
            id: program.clone(),
            application: self.application.clone(),
        })
    }
}
