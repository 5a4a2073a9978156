//! Template VMs built from cloud images.
//!
//! A template is a cloud image imported once with a cloud-init NoCloud
//! seed attached. cloud-init gets a bounded time to configure the guest,
//! then the VM is shut off and left defined so clusters can clone it as
//! their `base_image`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use regex::{Captures, Regex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::control::{ControlError, ControlPlane, DomainState, ImportRequest};
use crate::graph::{ImageSource, TemplateNode};
use crate::provisioner::VmProvisioner;
use crate::retry::{poll_until, RetryPolicy};

const ENV_PLACEHOLDER: &str = r"\$\{env:([A-Za-z0-9_]+)\}";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template {template}: {source}")]
    Control {
        template: String,
        #[source]
        source: ControlError,
    },

    #[error("template {template}: base image {} not found", .path.display())]
    MissingImage { template: String, path: PathBuf },

    /// user-data refers to an environment variable that is not set.
    #[error("template {template}: user-data needs ${{env:{variable}}}, which is not set")]
    UnsetVariable { template: String, variable: String },
}

/// What `build` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOutcome {
    Created,
    /// A VM of that name exists and replacing it was not requested.
    Exists,
}

/// Replace every `${env:NAME}` in `user_data` from `env`.
///
/// # Errors
///
/// Returns the name of the first variable missing from `env`.
pub fn substitute_env(user_data: &str, env: &BTreeMap<String, String>) -> Result<String, String> {
    let pattern = Regex::new(ENV_PLACEHOLDER).map_err(|e| e.to_string())?;
    if let Some(missing) = pattern
        .captures_iter(user_data)
        .map(|c| c[1].to_string())
        .find(|name| !env.contains_key(name))
    {
        return Err(missing);
    }
    Ok(pattern
        .replace_all(user_data, |c: &Captures<'_>| env.get(&c[1]).cloned().unwrap_or_default())
        .into_owned())
}

/// Write `user-data`, `meta-data` and `network-config` into
/// `<workdir>/nocloud` and return that directory.
async fn write_nocloud(template: &TemplateNode, user_data: &str) -> Result<PathBuf, ControlError> {
    let dir = template.workdir.join("nocloud");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ControlError::io(&dir, &e))?;
    for (file, content) in [
        ("user-data", user_data),
        ("meta-data", template.meta_data.as_str()),
        ("network-config", template.network_config.as_str()),
    ] {
        let path = dir.join(file);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ControlError::io(&path, &e))?;
    }
    debug!(template = %template.name, dir = %dir.display(), "NoCloud files written");
    Ok(dir)
}

/// Imports templates through the control plane.
pub struct TemplateBuilder {
    control: Arc<dyn ControlPlane>,
    vms: VmProvisioner,
}

impl TemplateBuilder {
    #[must_use]
    pub fn new(control: Arc<dyn ControlPlane>, shutdown_policy: RetryPolicy) -> Self {
        Self {
            vms: VmProvisioner::new(control.clone(), shutdown_policy),
            control,
        }
    }

    /// Create `template`. An existing VM of the same name is kept unless
    /// `force` is set, in which case it is removed first.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::UnsetVariable`] before anything is touched
    /// if user-data cannot be rendered, [`TemplateError::MissingImage`] if
    /// a local base image does not exist, and control-plane failures.
    pub async fn build(&self, template: &TemplateNode, force: bool) -> Result<TemplateOutcome, TemplateError> {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        self.build_with(template, force, &env).await
    }

    /// [`Self::build`] with an explicit environment for user-data.
    ///
    /// # Errors
    ///
    /// See [`Self::build`].
    pub async fn build_with(
        &self,
        template: &TemplateNode,
        force: bool,
        env: &BTreeMap<String, String>,
    ) -> Result<TemplateOutcome, TemplateError> {
        let name = template.name.as_str();
        let to_err = |source: ControlError| TemplateError::Control {
            template: name.to_string(),
            source,
        };

        let user_data = substitute_env(&template.user_data, env).map_err(|variable| {
            TemplateError::UnsetVariable {
                template: name.to_string(),
                variable,
            }
        })?;

        let state = self.control.domain_state(name).await.map_err(to_err)?;
        if state != DomainState::Absent {
            if !force {
                info!(template = %name, state = %state, "Template exists, skipping");
                return Ok(TemplateOutcome::Exists);
            }
            warn!(template = %name, "Replacing existing template");
            if matches!(state, DomainState::Running | DomainState::Paused | DomainState::Unknown) {
                self.vms.stop(name).await.map_err(to_err)?;
            }
            match self.control.undefine_domain(name).await {
                Err(e) if !e.is_not_found() => return Err(to_err(e)),
                _ => {}
            }
        }

        tokio::fs::create_dir_all(&template.workdir)
            .await
            .map_err(|e| to_err(ControlError::io(&template.workdir, &e)))?;
        self.fetch_image(template).await?;
        if let Some(size) = &template.disk_size {
            self.control
                .resize_disk_image(&template.disk_path, size)
                .await
                .map_err(to_err)?;
        }

        let nocloud = write_nocloud(template, &user_data).await.map_err(to_err)?;
        self.control
            .build_seed_image(&nocloud, &template.seed_path)
            .await
            .map_err(to_err)?;

        self.control
            .import_domain(&ImportRequest {
                name: name.to_string(),
                memory_mib: template.memory_mib,
                vcpus: template.vcpus,
                os_variant: template.os_variant.clone(),
                disk_path: template.disk_path.clone(),
                disk_format: template.disk_format.clone(),
                seed_path: template.seed_path.clone(),
                network: template.network.clone(),
                extra_args: template.extra_args.clone(),
            })
            .await
            .map_err(to_err)?;

        self.settle(template).await.map_err(to_err)?;

        if let Err(e) = tokio::fs::remove_dir_all(&nocloud).await {
            warn!(template = %name, error = %e, "Could not remove NoCloud files");
        }
        info!(template = %name, image = %template.disk_path.display(), "Template ready");
        Ok(TemplateOutcome::Created)
    }

    /// Put the base image at `disk_path`.
    async fn fetch_image(&self, template: &TemplateNode) -> Result<(), TemplateError> {
        let to_err = |source| TemplateError::Control {
            template: template.name.clone(),
            source,
        };
        match &template.image {
            ImageSource::Url(url) => self
                .control
                .download_disk_image(url, &template.disk_path)
                .await
                .map_err(to_err),
            ImageSource::Local(path) if path == &template.disk_path => Ok(()),
            ImageSource::Local(path) => {
                if !self.control.disk_image_exists(path).await.map_err(to_err)? {
                    return Err(TemplateError::MissingImage {
                        template: template.name.clone(),
                        path: path.clone(),
                    });
                }
                info!(template = %template.name, from = %path.display(), "Copying base image");
                self.control
                    .copy_disk_image(path, &template.disk_path)
                    .await
                    .map_err(to_err)
            }
        }
    }

    /// Give cloud-init until the timeout to power the guest off, then shut
    /// it down.
    async fn settle(&self, template: &TemplateNode) -> Result<(), ControlError> {
        let name = template.name.as_str();
        info!(template = %name, timeout = ?template.cloudinit_timeout, "Waiting for cloud-init");
        let control = &self.control;
        let policy = RetryPolicy::fixed(template.poll_interval, template.cloudinit_timeout);
        let finished = poll_until(&policy, "cloud-init", move |_| async move {
            match control.domain_state(name).await {
                Ok(DomainState::ShutOff) => Ok(()),
                Ok(state) => Err(format!("still {state}")),
                Err(e) => Err(e.to_string()),
            }
        })
        .await;

        if finished.is_ok() {
            info!(template = %name, "Guest powered itself off");
            return Ok(());
        }
        info!(template = %name, "cloud-init time is up, shutting the template down");
        self.vms.stop(name).await
    }
}
