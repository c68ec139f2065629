//! Device classes: named presets of selectors and configuration that
//! claims pick up by reference at allocation time.

use serde::{Deserialize, Serialize};

use crate::claim::{self, DeviceConfiguration, DeviceSelector};
use crate::error::{ValidationErrors, ValidationResult};
use crate::meta::ObjectMeta;

pub const CLASS_MAX_CONFIGS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClass {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeviceClassSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClassSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<DeviceSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<DeviceClassConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceClassConfiguration {
    #[serde(flatten)]
    pub config: DeviceConfiguration,
}

impl DeviceClass {
    pub fn new(name: impl Into<String>, selectors: Vec<DeviceSelector>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: DeviceClassSpec {
                selectors,
                config: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn validate(&self) -> ValidationResult {
        let mut errs = ValidationErrors::default();
        self.metadata.validate(&mut errs, false);
        claim::validate_selectors(&mut errs, "spec.selectors", &self.spec.selectors);
        errs.max_items("spec.config", CLASS_MAX_CONFIGS, self.spec.config.len());
        for (i, c) in self.spec.config.iter().enumerate() {
            c.config.validate(&mut errs, &format!("spec.config[{i}]"));
        }
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_round_trips() {
        let mut class = DeviceClass::new(
            "gpu-basic",
            vec![DeviceSelector::cel("device.driver == \"gpu.example.com\"")],
        );
        class.spec.config.push(DeviceClassConfiguration {
            config: DeviceConfiguration::opaque("gpu.example.com", serde_json::json!({"mode": "shared"})),
        });
        assert_eq!(class.validate(), Ok(()));

        let json = serde_json::to_value(&class).unwrap();
        assert_eq!(json["spec"]["selectors"][0]["cel"]["expression"], "device.driver == \"gpu.example.com\"");
        assert_eq!(json["spec"]["config"][0]["opaque"]["parameters"]["mode"], "shared");
        let back: DeviceClass = serde_json::from_value(json).unwrap();
        assert_eq!(back, class);
    }

    #[test]
    fn class_is_cluster_scoped() {
        let mut class = DeviceClass::new("gpu-basic", Vec::new());
        class.metadata.namespace = "ml".to_string();
        assert!(class.validate().is_err());
    }

    #[test]
    fn too_many_selectors_rejected() {
        let selectors = (0..33).map(|i| DeviceSelector::cel(format!("true // {i}"))).collect();
        assert!(DeviceClass::new("gpu-basic", selectors).validate().is_err());
    }
}
