use super::provision::{Image, ImageSpec, Instance, VmProvider, select_newest};
use crate::clock;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Shell command lines for each lifecycle step, read from a JSON file.
///
/// Every command runs under `sh -c` with the image labels exported as
/// `TESTBENCH_LABEL_<NAME>` plus `TESTBENCH_IMAGE` and `TESTBENCH_INSTANCE`
/// where they apply. `build` prints the new image id as its last stdout
/// line; `serial` prints the console log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCommands {
    pub build: String,
    pub boot: String,
    pub reset: String,
    pub delete: String,
    pub serial: String,
}

impl VmCommands {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Drives an external VM tool through shell commands and keeps a JSON
/// index of the images it has built.
pub struct CommandVmProvider {
    commands: VmCommands,
    index: PathBuf,
    index_lock: Mutex<()>,
}

fn env_name(label: &str) -> String {
    format!(
        "TESTBENCH_LABEL_{}",
        label.to_ascii_uppercase().replace('-', "_")
    )
}

impl CommandVmProvider {
    pub fn new(commands: VmCommands, index: impl Into<PathBuf>) -> Self {
        Self {
            commands,
            index: index.into(),
            index_lock: Mutex::new(()),
        }
    }

    async fn run(&self, step: &str, line: &str, env: &BTreeMap<String, String>) -> Result<String> {
        debug!(step, command = line, "running vm command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(line)
            .envs(env)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {} command", step))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} command exited with {}: {}",
                step,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn read_index(&self) -> Result<Vec<Image>> {
        match tokio::fs::read(&self.index).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing image index {}", self.index.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.index.display())),
        }
    }

    fn label_env(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        labels.iter().map(|(k, v)| (env_name(k), v.clone())).collect()
    }

    fn instance_env(instance: &Instance) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("TESTBENCH_INSTANCE".to_string(), instance.name.clone()),
            ("TESTBENCH_IMAGE".to_string(), instance.image_id.clone()),
        ])
    }
}

#[async_trait]
impl VmProvider for CommandVmProvider {
    async fn find_image(&self, spec: &ImageSpec) -> Result<Option<Image>> {
        let images = self.read_index().await?;
        Ok(select_newest(&images, spec).cloned())
    }

    async fn build_image(&self, spec: &ImageSpec) -> Result<Image> {
        let labels = spec.labels();
        let stdout = self
            .run("build", &self.commands.build, &Self::label_env(&labels))
            .await?;
        let id = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("build command printed no image id"))?
            .to_string();
        let image = Image {
            id,
            name: spec.image.to_string(),
            labels,
            created: clock::unix() as u64,
            deprecated: false,
        };

        let _lock = self.index_lock.lock().await;
        let mut images = self.read_index().await?;
        images.push(image.clone());
        if let Some(parent) = self.index.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.index, serde_json::to_vec_pretty(&images)?)
            .await
            .with_context(|| format!("writing {}", self.index.display()))?;
        info!(image = %image.id, name = %image.name, "built image");
        Ok(image)
    }

    async fn boot(&self, image: &Image, instance_name: &str) -> Result<Instance> {
        let instance = Instance {
            name: instance_name.to_string(),
            image_id: image.id.clone(),
        };
        let mut env = Self::label_env(&image.labels);
        env.extend(Self::instance_env(&instance));
        self.run("boot", &self.commands.boot, &env).await?;
        Ok(instance)
    }

    async fn reset(&self, instance: &Instance) -> Result<()> {
        self.run("reset", &self.commands.reset, &Self::instance_env(instance))
            .await?;
        Ok(())
    }

    async fn delete(&self, instance: &Instance) -> Result<()> {
        self.run("delete", &self.commands.delete, &Self::instance_env(instance))
            .await?;
        Ok(())
    }

    async fn serial_log(&self, instance: &Instance) -> Result<String> {
        self.run("serial", &self.commands.serial, &Self::instance_env(instance))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::sample_config;

    fn commands() -> VmCommands {
        VmCommands {
            build: "echo building >&2; echo \"img-$TESTBENCH_LABEL_OPERATOR-$TESTBENCH_LABEL_SINK_PORT\"".into(),
            boot: "test -n \"$TESTBENCH_INSTANCE\"".into(),
            reset: "true".into(),
            delete: "true".into(),
            serial: "echo \"console of $TESTBENCH_INSTANCE\"".into(),
        }
    }

    #[test]
    fn test_env_name() {
        assert_eq!(env_name("control-ip"), "TESTBENCH_LABEL_CONTROL_IP");
    }

    #[tokio::test]
    async fn test_build_then_find() {
        let dir = tempfile::tempdir().unwrap();
        let vms = CommandVmProvider::new(commands(), dir.path().join("images.json"));
        let spec = ImageSpec::from_config(&sample_config("t")).unwrap();
        assert!(vms.find_image(&spec).await.unwrap().is_none());

        let built = vms.build_image(&spec).await.unwrap();
        assert_eq!(built.id, "img-filter-8083");
        assert_eq!(vms.find_image(&spec).await.unwrap(), Some(built.clone()));

        let instance = vms.boot(&built, "unikraft-t").await.unwrap();
        assert_eq!(
            vms.serial_log(&instance).await.unwrap().trim(),
            "console of unikraft-t"
        );
        vms.reset(&instance).await.unwrap();
        vms.delete(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmds = commands();
        cmds.build = "echo no space left >&2; exit 3".into();
        let vms = CommandVmProvider::new(cmds, dir.path().join("images.json"));
        let spec = ImageSpec::from_config(&sample_config("t")).unwrap();
        let err = vms.build_image(&spec).await.unwrap_err();
        assert!(err.to_string().contains("no space left"));
    }
}
