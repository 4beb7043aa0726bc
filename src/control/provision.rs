use crate::experiment::{ExperimentConfig, ImageName};
use crate::net::utils::encode_ip;
use crate::protocol::TupleFormat;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything an image bakes in: the operator and where to reach the three
/// roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub image: ImageName,
    pub control: (String, u16),
    pub source: (String, u16),
    pub sink: (String, u16),
    pub tuple_format: TupleFormat,
}

impl ImageSpec {
    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        Ok(Self {
            image: config.image()?,
            control: (config.control_address.clone(), config.control_port),
            source: (config.source_address.clone(), config.source_port),
            sink: (config.sink_address.clone(), config.sink_port),
            tuple_format: config.tuple_format,
        })
    }

    /// Labels an existing image must carry to be reused.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("image-name".into(), self.image.to_string());
        labels.insert("framework".into(), self.image.framework.to_string());
        labels.insert("operator".into(), self.image.operator.to_string());
        for (role, (host, port)) in [
            ("control", &self.control),
            ("source", &self.source),
            ("sink", &self.sink),
        ] {
            labels.insert(format!("{}-ip", role), encode_ip(host));
            labels.insert(format!("{}-port", role), port.to_string());
        }
        labels.insert("tuple-format".into(), self.tuple_format.to_string());
        labels
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Unix seconds.
    pub created: u64,
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub image_id: String,
}

/// Newest non-deprecated image carrying every label of `spec`.
pub fn select_newest<'a>(
    images: impl IntoIterator<Item = &'a Image>,
    spec: &ImageSpec,
) -> Option<&'a Image> {
    let wanted = spec.labels();
    images
        .into_iter()
        .filter(|image| !image.deprecated)
        .filter(|image| wanted.iter().all(|(k, v)| image.labels.get(k) == Some(v)))
        .max_by_key(|image| image.created)
}

/// Image registry, image builder and VM lifecycle API.
#[async_trait]
pub trait VmProvider: Send + Sync {
    async fn find_image(&self, spec: &ImageSpec) -> Result<Option<Image>>;
    async fn build_image(&self, spec: &ImageSpec) -> Result<Image>;
    async fn boot(&self, image: &Image, instance_name: &str) -> Result<Instance>;
    async fn reset(&self, instance: &Instance) -> Result<()>;
    async fn delete(&self, instance: &Instance) -> Result<()>;
    async fn serial_log(&self, instance: &Instance) -> Result<String>;
}

/// Deletes the VM on every exit path. [`InstanceGuard::teardown`] is the
/// normal route; dropping the guard without it deletes in the background.
pub struct InstanceGuard {
    vms: Arc<dyn VmProvider>,
    instance: Option<Instance>,
}

impl InstanceGuard {
    pub fn new(vms: Arc<dyn VmProvider>, instance: Instance) -> Self {
        Self {
            vms,
            instance: Some(instance),
        }
    }

    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    pub async fn serial_log(&self) -> Option<String> {
        let instance = self.instance.as_ref()?;
        match self.vms.serial_log(instance).await {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "failed to read serial log");
                None
            }
        }
    }

    /// Captures the serial console, then deletes the VM.
    pub async fn teardown(mut self) -> Option<String> {
        let log = self.serial_log().await;
        if let Some(instance) = self.instance.take() {
            match self.vms.delete(&instance).await {
                Ok(()) => info!(instance = %instance.name, "deleted instance"),
                Err(e) => warn!(instance = %instance.name, error = %e, "failed to delete instance"),
            }
        }
        log
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(instance = %instance.name, "no runtime left to delete instance");
            return;
        };
        let vms = self.vms.clone();
        handle.spawn(async move {
            if let Err(e) = vms.delete(&instance).await {
                warn!(instance = %instance.name, error = %e, "failed to delete instance");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::sample_config;

    fn image(id: &str, spec: &ImageSpec, created: u64) -> Image {
        Image {
            id: id.into(),
            name: spec.image.to_string(),
            labels: spec.labels(),
            created,
            deprecated: false,
        }
    }

    #[test]
    fn test_labels_encode_ips() {
        let spec = ImageSpec::from_config(&sample_config("t")).unwrap();
        let labels = spec.labels();
        assert_eq!(labels["source-ip"], "127-0-0-1");
        assert_eq!(labels["sink-port"], "8083");
        assert_eq!(labels["operator"], "filter");
    }

    #[test]
    fn test_newest_matching_wins() {
        let spec = ImageSpec::from_config(&sample_config("t")).unwrap();
        let mut other_config = sample_config("t");
        other_config.sink_port = 9999;
        let other = ImageSpec::from_config(&other_config).unwrap();

        let mut deprecated = image("d", &spec, 50);
        deprecated.deprecated = true;
        let images = vec![
            image("old", &spec, 10),
            image("new", &spec, 20),
            image("mismatch", &other, 30),
            deprecated,
        ];
        assert_eq!(select_newest(&images, &spec).unwrap().id, "new");
        assert_eq!(select_newest(&images, &other).unwrap().id, "mismatch");
        assert!(select_newest(&images[..0], &spec).is_none());
    }
}
