//! Deployment of built modules.
//!
//! Hashes the build's deploy files, uploads only artefacts the controller is
//! missing, creates the deployment and promotes it to the module's active
//! deployment. With `wait` set, polls status until the requested replicas
//! are assigned.

use std::os::unix::fs::PermissionsExt;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use parallax_proto::controller::{CreateDeploymentRequest, DeploymentArtefact};
use parallax_proto::language::ModuleConfig;
use parallax_proto::schema::Module;
use parallax_proto::{DeploymentKey, Digest};

use crate::config::DeployConfig;
use crate::controller_client::ControllerClient;
use crate::error::{EngineError, EngineResult};

pub async fn deploy_module(
    controller: &dyn ControllerClient,
    config: &ModuleConfig,
    schema: &Module,
    deploy_files: &[String],
    min_replicas: u32,
    wait: bool,
    timing: &DeployConfig,
) -> EngineResult<DeploymentKey> {
    if deploy_files.is_empty() {
        return Err(EngineError::Config(format!(
            "module {} produced no deploy files",
            config.module
        )));
    }
    let deploy_dir = config.abs_deploy_dir();
    let mut artefacts = Vec::with_capacity(deploy_files.len());
    let mut contents = Vec::with_capacity(deploy_files.len());
    for file in deploy_files {
        let path = deploy_dir.join(file);
        let content = Bytes::from(tokio::fs::read(&path).await?);
        let executable = tokio::fs::metadata(&path).await?.permissions().mode() & 0o111 != 0;
        let digest = Digest::of(&content);
        artefacts.push(DeploymentArtefact {
            digest,
            path: file.clone(),
            executable,
        });
        contents.push((digest, content));
    }

    let missing = controller
        .get_artefact_diffs(artefacts.iter().map(|a| a.digest).collect())
        .await?;
    for (digest, content) in contents {
        if missing.contains(&digest) {
            debug!(module = config.module, %digest, "uploading artefact");
            controller.upload_artefact(content).await?;
        }
    }

    let key = controller
        .create_deployment(CreateDeploymentRequest {
            language: config.language.clone(),
            schema: schema.clone(),
            artefacts,
        })
        .await?;
    controller.replace_deploy(&key, min_replicas).await?;
    info!(module = config.module, deployment = %key, min_replicas, "deployed");

    if wait && min_replicas > 0 {
        wait_for_replicas(controller, &key, min_replicas, timing).await?;
    }
    Ok(key)
}

async fn wait_for_replicas(
    controller: &dyn ControllerClient,
    key: &DeploymentKey,
    min_replicas: u32,
    timing: &DeployConfig,
) -> EngineResult<()> {
    let deadline = Instant::now() + timing.wait_timeout;
    loop {
        let status = controller.status().await?;
        let assigned = status
            .deployments
            .iter()
            .find(|d| &d.key == key)
            .map_or(0, |d| d.assigned_replicas);
        if assigned >= min_replicas {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(EngineError::DeadlineExceeded(format!(
                "deployment {key} reached {assigned}/{min_replicas} replicas",
            )));
        }
        tokio::time::sleep(timing.poll_interval).await;
    }
}

/// Scale the module's active deployment to zero, if it has one.
pub async fn terminate_module_deployment(
    controller: &dyn ControllerClient,
    module: &str,
) -> EngineResult<()> {
    if let Some(deployment) = controller.active_deployment(module).await? {
        info!(module, deployment = %deployment.key, "terminating deployment");
        controller.replace_deploy(&deployment.key, 0).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller_client::FakeControllerClient;

    fn config(dir: &std::path::Path) -> ModuleConfig {
        ModuleConfig {
            module: "echo".into(),
            language: "go".into(),
            dir: dir.to_path_buf(),
            deploy_dir: ".build".into(),
            watch: vec!["**/*".into()],
            build: None,
            generated_schema_dir: None,
            language_config: Default::default(),
        }
    }

    #[tokio::test]
    async fn uploads_only_missing_artefacts_and_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join(".build");
        std::fs::create_dir_all(&build).unwrap();
        std::fs::write(build.join("main"), "binary").unwrap();
        let mut perms = std::fs::metadata(build.join("main")).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(build.join("main"), perms).unwrap();
        std::fs::write(build.join("config.json"), "{}").unwrap();

        let controller = FakeControllerClient::new();
        // One artefact is already cached.
        controller.upload_artefact(Bytes::from_static(b"{}")).await.unwrap();

        let config = config(dir.path());
        let key = deploy_module(
            &controller,
            &config,
            &Module::new("echo"),
            &["main".into(), "config.json".into()],
            1,
            true,
            &DeployConfig::default(),
        )
        .await
        .unwrap();

        let ops = controller.operations();
        // The seed upload plus exactly one more for the missing artefact.
        assert_eq!(ops.iter().filter(|op| op.starts_with("upload ")).count(), 2);
        assert!(ops.iter().any(|op| op.starts_with("create ")));
        assert!(ops.contains(&format!("replace {key} 1")));
        assert!(controller.active_schema("echo").is_some());
    }

    #[tokio::test]
    async fn terminate_scales_the_active_deployment_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join(".build");
        std::fs::create_dir_all(&build).unwrap();
        std::fs::write(build.join("main"), "binary").unwrap();

        let controller = FakeControllerClient::new();
        let config = config(dir.path());
        let key = deploy_module(
            &controller,
            &config,
            &Module::new("echo"),
            &["main".into()],
            1,
            false,
            &DeployConfig::default(),
        )
        .await
        .unwrap();
        assert!(controller.active_schema("echo").is_some());

        terminate_module_deployment(&controller, "echo").await.unwrap();
        assert!(controller.active_schema("echo").is_none());
        assert!(controller.operations().contains(&format!("replace {key} 0")));
    }

    #[tokio::test]
    async fn empty_deploy_set_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = FakeControllerClient::new();
        let err = deploy_module(
            &controller,
            &config(dir.path()),
            &Module::new("echo"),
            &[],
            1,
            false,
            &DeployConfig::default(),
        )
        .await;
        assert!(matches!(err, Err(EngineError::Config(_))));
    }
}
