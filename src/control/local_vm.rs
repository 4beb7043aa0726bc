use super::provision::{Image, ImageSpec, Instance, VmProvider, select_newest};
use crate::clock;
use crate::net::utils::resolve;
use crate::uut::{Console, UnitConfig, run_unit};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct LocalInstance {
    config: UnitConfig,
    console: Console,
    task: JoinHandle<()>,
}

/// Runs the emulated unit as a task per instance. Images are just the
/// resolved endpoints they were built for.
#[derive(Default)]
pub struct LocalVmProvider {
    images: DashMap<String, (Image, ImageSpec)>,
    instances: DashMap<String, LocalInstance>,
    next_image: AtomicU64,
}

impl LocalVmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> usize {
        self.instances.len()
    }

    fn spawn_unit(name: &str, config: UnitConfig, console: Console) -> JoinHandle<()> {
        let name = name.to_string();
        tokio::spawn(async move {
            match run_unit(config, console.clone()).await {
                Ok(report) => info!(instance = %name, ?report, "unit finished its stream"),
                Err(e) => {
                    console.line(format!("error: {:#}", e));
                    warn!(instance = %name, error = %e, "unit stopped");
                }
            }
        })
    }
}

#[async_trait]
impl VmProvider for LocalVmProvider {
    async fn find_image(&self, spec: &ImageSpec) -> Result<Option<Image>> {
        let images: Vec<Image> = self.images.iter().map(|e| e.value().0.clone()).collect();
        Ok(select_newest(&images, spec).cloned())
    }

    async fn build_image(&self, spec: &ImageSpec) -> Result<Image> {
        let n = self.next_image.fetch_add(1, Ordering::Relaxed);
        let image = Image {
            id: format!("local-{}", n),
            name: spec.image.to_string(),
            labels: spec.labels(),
            // ordering among images built in the same second
            created: clock::unix() as u64 * 1000 + n,
            deprecated: false,
        };
        self.images
            .insert(image.id.clone(), (image.clone(), spec.clone()));
        Ok(image)
    }

    async fn boot(&self, image: &Image, instance_name: &str) -> Result<Instance> {
        let spec = self
            .images
            .get(&image.id)
            .map(|e| e.value().1.clone())
            .ok_or_else(|| anyhow!("unknown image {}", image.id))?;
        let config = UnitConfig {
            control: resolve(&spec.control.0, spec.control.1).await?,
            source: resolve(&spec.source.0, spec.source.1).await?,
            sink: resolve(&spec.sink.0, spec.sink.1).await?,
            tuple_format: spec.tuple_format,
            operator: spec.image.operator,
        };
        let console = Console::default();
        let task = Self::spawn_unit(instance_name, config.clone(), console.clone());
        if let Some(old) = self.instances.insert(
            instance_name.to_string(),
            LocalInstance {
                config,
                console,
                task,
            },
        ) {
            old.task.abort();
        }
        Ok(Instance {
            name: instance_name.to_string(),
            image_id: image.id.clone(),
        })
    }

    async fn reset(&self, instance: &Instance) -> Result<()> {
        let mut entry = self
            .instances
            .get_mut(&instance.name)
            .ok_or_else(|| anyhow!("unknown instance {}", instance.name))?;
        entry.task.abort();
        entry.console.line("--- reset ---");
        let task = Self::spawn_unit(&instance.name, entry.config.clone(), entry.console.clone());
        entry.task = task;
        Ok(())
    }

    async fn delete(&self, instance: &Instance) -> Result<()> {
        if let Some((_, old)) = self.instances.remove(&instance.name) {
            old.task.abort();
        }
        Ok(())
    }

    async fn serial_log(&self, instance: &Instance) -> Result<String> {
        self.instances
            .get(&instance.name)
            .map(|e| e.console.contents())
            .ok_or_else(|| anyhow!("unknown instance {}", instance.name))
    }
}
