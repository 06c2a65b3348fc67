//! Workflow manifest applied at boot.
//!
//! ```yaml
//! projects:
//!   - name: demo
//!     owner: ops
//!     workflows:
//!       - alias: hourly-report
//!         nb_name: report
//!         queue: cpu.default
//!         timeout_secs: 600
//!         params: { REGION: eu }
//!         schedule: { kind: interval, every_seconds: 3600 }
//! ```
//!
//! Projects are matched by normalized name and workflows by alias, so
//! applying the same manifest twice changes nothing but revisions.

use std::path::Path;

use anyhow::{Context, bail};
use nbgrid_core::{Project, SharedClock, WorkflowDef, normalize_name};
use nbgrid_scheduler::WorkflowScheduler;
use nbgrid_state::StateStore;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub projects: Vec<ProjectManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub workflows: Vec<WorkflowDef>,
}

/// What [`Manifest::apply`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub projects_created: usize,
    pub workflows_created: usize,
    pub workflows_updated: usize,
}

impl Manifest {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let manifest: Self = serde_yaml::from_str(content).context("parsing workflow manifest")?;
        for project in &manifest.projects {
            for def in &project.workflows {
                if def.alias.as_deref().is_none_or(|a| a.trim().is_empty()) {
                    bail!(
                        "project {}: workflow {} needs an alias",
                        project.name,
                        def.nb_name
                    );
                }
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading workflow manifest {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Create missing projects, then create or update every workflow.
    pub fn apply(
        &self,
        store: &StateStore,
        scheduler: &WorkflowScheduler,
        clock: &SharedClock,
    ) -> anyhow::Result<ApplyReport> {
        let mut report = ApplyReport::default();
        let projects = store.list_projects()?;

        for entry in &self.projects {
            let wanted = normalize_name(&entry.name);
            let project = match projects.iter().find(|p| p.name == wanted) {
                Some(project) => project.clone(),
                None => {
                    let project = Project::new(&entry.name, &entry.owner, clock.now())?;
                    store.create_project(&project)?;
                    info!(project_id = %project.project_id, name = %project.name, "project created");
                    report.projects_created += 1;
                    project
                }
            };

            for def in &entry.workflows {
                let alias = def.alias.as_deref().unwrap_or_default();
                match store.get_workflow_by_alias(&project.project_id, alias)? {
                    Some(existing) => {
                        scheduler
                            .update(&project.project_id, &existing.workflow_id, def.clone(), None)
                            .with_context(|| format!("updating workflow {alias}"))?;
                        report.workflows_updated += 1;
                    }
                    None => {
                        scheduler
                            .create(&project.project_id, def.clone())
                            .with_context(|| format!("creating workflow {alias}"))?;
                        report.workflows_created += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}
