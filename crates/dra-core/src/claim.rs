//! Demand side: claims, requests, selectors, constraints, configuration
//! and tolerations.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::catalog::{DeviceTaint, TaintEffect};
use crate::error::{OneOfError, ValidationErrors, ValidationResult};
use crate::meta::ObjectMeta;
use crate::names;
use crate::status::ClaimStatus;

pub const CLAIM_MAX_REQUESTS: usize = 32;
pub const CLAIM_MAX_CONSTRAINTS: usize = 32;
pub const CLAIM_MAX_CONFIGS: usize = 32;
pub const REQUEST_MAX_SELECTORS: usize = 32;
pub const FIRST_AVAILABLE_MAX: usize = 8;
pub const REQUEST_MAX_TOLERATIONS: usize = 16;
pub const CEL_EXPRESSION_MAX_LENGTH: usize = 10 * 1024;
pub const OPAQUE_PARAMETERS_MAX_LENGTH: usize = 10 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub metadata: ObjectMeta,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    #[serde(default)]
    pub devices: DeviceClaim,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaim {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<DeviceRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<DeviceConstraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<DeviceClaimConfiguration>,
}

// ── Requests ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub name: String,
    #[serde(flatten)]
    pub kind: RequestKind,
}

/// Either one exact request or an ordered list of alternatives, tried in
/// order until one can be satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RequestKindFields", into = "RequestKindFields")]
pub enum RequestKind {
    Exactly(ExactDeviceRequest),
    FirstAvailable(Vec<DeviceSubRequest>),
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestKindFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exactly: Option<ExactDeviceRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_available: Option<Vec<DeviceSubRequest>>,
}

impl TryFrom<RequestKindFields> for RequestKind {
    type Error = OneOfError;

    fn try_from(f: RequestKindFields) -> Result<Self, Self::Error> {
        match (f.exactly, f.first_available) {
            (Some(e), None) => Ok(RequestKind::Exactly(e)),
            (None, Some(subs)) => Ok(RequestKind::FirstAvailable(subs)),
            (e, s) => Err(OneOfError {
                members: "exactly, firstAvailable",
                found: usize::from(e.is_some()) + usize::from(s.is_some()),
            }),
        }
    }
}

impl From<RequestKind> for RequestKindFields {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Exactly(e) => RequestKindFields {
                exactly: Some(e),
                first_available: None,
            },
            RequestKind::FirstAvailable(s) => RequestKindFields {
                exactly: None,
                first_available: Some(s),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactDeviceRequest {
    pub device_class_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<DeviceSelector>,
    #[serde(default)]
    pub allocation_mode: AllocationMode,
    /// Only used with [`AllocationMode::ExactCount`]; defaults to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_access: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<DeviceToleration>,
}

/// One alternative of a `firstAvailable` list. Admin access is not
/// available on alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSubRequest {
    pub name: String,
    #[serde(flatten)]
    pub request: ExactDeviceRequest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationMode {
    #[default]
    ExactCount,
    All,
}

impl ExactDeviceRequest {
    pub fn for_class(class: impl Into<String>) -> Self {
        Self {
            device_class_name: class.into(),
            ..Self::default()
        }
    }

    /// Number of devices wanted in `ExactCount` mode.
    pub fn count(&self) -> i64 {
        self.count.unwrap_or(1)
    }

    pub fn admin_access(&self) -> bool {
        self.admin_access.unwrap_or(false)
    }

    fn validate(&self, errs: &mut ValidationErrors, field: &str, allow_admin: bool) {
        names::validate_dns_subdomain(
            errs,
            &format!("{field}.deviceClassName"),
            &self.device_class_name,
        );
        validate_selectors(errs, &format!("{field}.selectors"), &self.selectors);
        match self.allocation_mode {
            AllocationMode::ExactCount => {
                if let Some(c) = self.count
                    && c <= 0
                {
                    errs.invalid(format!("{field}.count"), c.to_string(), "must be greater than zero");
                }
            }
            AllocationMode::All => {
                if self.count.is_some() {
                    errs.forbidden(format!("{field}.count"), "must not be set with allocationMode All");
                }
            }
        }
        if !allow_admin && self.admin_access.is_some() {
            errs.forbidden(
                format!("{field}.adminAccess"),
                "not supported on firstAvailable alternatives",
            );
        }
        errs.max_items(
            format!("{field}.tolerations"),
            REQUEST_MAX_TOLERATIONS,
            self.tolerations.len(),
        );
        for (i, t) in self.tolerations.iter().enumerate() {
            t.validate(errs, &format!("{field}.tolerations[{i}]"));
        }
    }
}

// ── Selectors ─────────────────────────────────────────────────────

/// A device filter. Serialized as `{"cel": {"expression": "..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    Cel(CelDeviceSelector),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CelDeviceSelector {
    pub expression: String,
}

impl DeviceSelector {
    pub fn cel(expression: impl Into<String>) -> Self {
        DeviceSelector::Cel(CelDeviceSelector {
            expression: expression.into(),
        })
    }

    pub fn expression(&self) -> &str {
        match self {
            DeviceSelector::Cel(c) => &c.expression,
        }
    }
}

pub(crate) fn validate_selectors(errs: &mut ValidationErrors, field: &str, selectors: &[DeviceSelector]) {
    errs.max_items(field, REQUEST_MAX_SELECTORS, selectors.len());
    for (i, s) in selectors.iter().enumerate() {
        let ef = format!("{field}[{i}].cel.expression");
        let expr = s.expression();
        if expr.trim().is_empty() {
            errs.required(ef);
        } else if expr.len() > CEL_EXPRESSION_MAX_LENGTH {
            errs.too_long(ef, CEL_EXPRESSION_MAX_LENGTH, expr.len());
        }
    }
}

// ── Constraints ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConstraint {
    /// Requests this constraint applies to. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<String>,
    /// Fully-qualified attribute that every chosen device must share.
    /// `None` adds no extra constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_attribute: Option<String>,
}

impl DeviceConstraint {
    /// Whether the constraint covers the result request `request`
    /// (`main` or `main/sub`).
    pub fn applies_to(&self, request: &str) -> bool {
        self.requests.is_empty() || self.requests.iter().any(|r| reference_matches(r, request))
    }
}

// ── Configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaimConfiguration {
    /// Requests this configuration applies to. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<String>,
    #[serde(flatten)]
    pub config: DeviceConfiguration,
}

/// Driver configuration. Serialized as `{"opaque": {"driver": ..., "parameters": {...}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceConfiguration {
    Opaque(OpaqueDeviceConfiguration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueDeviceConfiguration {
    pub driver: String,
    pub parameters: serde_json::Value,
}

impl DeviceConfiguration {
    pub fn opaque(driver: impl Into<String>, parameters: serde_json::Value) -> Self {
        DeviceConfiguration::Opaque(OpaqueDeviceConfiguration {
            driver: driver.into(),
            parameters,
        })
    }

    pub fn driver(&self) -> &str {
        match self {
            DeviceConfiguration::Opaque(o) => &o.driver,
        }
    }

    pub(crate) fn validate(&self, errs: &mut ValidationErrors, field: &str) {
        match self {
            DeviceConfiguration::Opaque(o) => {
                names::validate_driver_name(errs, &format!("{field}.opaque.driver"), &o.driver);
                let pf = format!("{field}.opaque.parameters");
                if !o.parameters.is_object() {
                    errs.invalid(pf.clone(), o.parameters.to_string(), "must be a JSON object");
                }
                let len = o.parameters.to_string().len();
                if len > OPAQUE_PARAMETERS_MAX_LENGTH {
                    errs.too_long(pf, OPAQUE_PARAMETERS_MAX_LENGTH, len);
                }
            }
        }
    }
}

// ── Tolerations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToleration {
    /// Empty matches every key, and requires `Exists`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// `None` matches every effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<TaintEffect>,
    /// How long a `NoExecute` taint is tolerated. `None` means forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    Exists,
    #[default]
    Equal,
}

impl DeviceToleration {
    pub fn tolerates(&self, taint: &DeviceTaint) -> bool {
        if self.effect.is_some_and(|e| e != taint.effect) {
            return false;
        }
        if !self.key.is_empty() && self.key != taint.key {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => !self.key.is_empty() && self.value == taint.value,
        }
    }

    fn validate(&self, errs: &mut ValidationErrors, field: &str) {
        if self.key.is_empty() {
            if self.operator != TolerationOperator::Exists {
                errs.invalid(
                    format!("{field}.operator"),
                    "Equal",
                    "an empty key requires operator Exists",
                );
            }
        } else {
            names::validate_label_name(errs, &format!("{field}.key"), &self.key);
        }
        match self.operator {
            TolerationOperator::Exists if !self.value.is_empty() => {
                errs.forbidden(format!("{field}.value"), "must be empty with operator Exists")
            }
            TolerationOperator::Equal => {
                names::validate_label_value(errs, &format!("{field}.value"), &self.value)
            }
            _ => {}
        }
        if self.toleration_seconds.is_some() && self.effect == Some(TaintEffect::NoSchedule) {
            errs.forbidden(
                format!("{field}.tolerationSeconds"),
                "only applies to the NoExecute effect",
            );
        }
    }
}

// ── References ────────────────────────────────────────────────────

/// Whether a request reference (`main` or `main/sub`) selects the result
/// request name `request`. A bare `main` covers all of its alternatives.
pub fn reference_matches(reference: &str, request: &str) -> bool {
    reference == request
        || request
            .strip_prefix(reference)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl DeviceClaim {
    pub fn request(&self, name: &str) -> Option<&DeviceRequest> {
        self.requests.iter().find(|r| r.name == name)
    }

    fn reference_exists(&self, reference: &str) -> bool {
        let (main, sub) = match reference.split_once('/') {
            Some((m, s)) => (m, Some(s)),
            None => (reference, None),
        };
        match (self.request(main), sub) {
            (Some(_), None) => true,
            (Some(r), Some(sub)) => match &r.kind {
                RequestKind::FirstAvailable(subs) => subs.iter().any(|s| s.name == sub),
                RequestKind::Exactly(_) => false,
            },
            (None, _) => false,
        }
    }

    fn validate_references(&self, errs: &mut ValidationErrors, field: &str, refs: &[String]) {
        let mut seen = HashSet::new();
        for r in refs {
            if !seen.insert(r.as_str()) {
                errs.duplicate(field, r);
            }
            if !self.reference_exists(r) {
                errs.invalid(field, r, "must reference a request of this claim");
            }
        }
    }

    pub(crate) fn validate(&self, errs: &mut ValidationErrors, field: &str) {
        errs.max_items(format!("{field}.requests"), CLAIM_MAX_REQUESTS, self.requests.len());
        let mut request_names = HashSet::new();
        for (i, req) in self.requests.iter().enumerate() {
            let rf = format!("{field}.requests[{i}]");
            names::validate_dns_label(errs, &format!("{rf}.name"), &req.name);
            if !request_names.insert(req.name.as_str()) {
                errs.duplicate(format!("{rf}.name"), &req.name);
            }
            match &req.kind {
                RequestKind::Exactly(e) => e.validate(errs, &format!("{rf}.exactly"), true),
                RequestKind::FirstAvailable(subs) => {
                    let sf = format!("{rf}.firstAvailable");
                    if subs.is_empty() {
                        errs.required(sf.clone());
                    }
                    errs.max_items(sf.clone(), FIRST_AVAILABLE_MAX, subs.len());
                    let mut sub_names = HashSet::new();
                    for (j, sub) in subs.iter().enumerate() {
                        let subf = format!("{sf}[{j}]");
                        names::validate_dns_label(errs, &format!("{subf}.name"), &sub.name);
                        if !sub_names.insert(sub.name.as_str()) {
                            errs.duplicate(format!("{subf}.name"), &sub.name);
                        }
                        sub.request.validate(errs, &subf, false);
                    }
                }
            }
        }

        errs.max_items(
            format!("{field}.constraints"),
            CLAIM_MAX_CONSTRAINTS,
            self.constraints.len(),
        );
        for (i, c) in self.constraints.iter().enumerate() {
            let cf = format!("{field}.constraints[{i}]");
            self.validate_references(errs, &format!("{cf}.requests"), &c.requests);
            if let Some(attr) = &c.match_attribute {
                names::validate_fully_qualified_name(errs, &format!("{cf}.matchAttribute"), attr);
            }
        }

        errs.max_items(format!("{field}.config"), CLAIM_MAX_CONFIGS, self.config.len());
        for (i, c) in self.config.iter().enumerate() {
            let cf = format!("{field}.config[{i}]");
            self.validate_references(errs, &format!("{cf}.requests"), &c.requests);
            c.config.validate(errs, &cf);
        }
    }
}

impl Claim {
    pub fn new(metadata: ObjectMeta, devices: DeviceClaim) -> Self {
        Self {
            metadata,
            spec: ClaimSpec { devices },
            status: ClaimStatus::default(),
        }
    }

    /// `{namespace}/{name}`.
    pub fn key(&self) -> String {
        self.metadata.key()
    }

    pub fn validate(&self) -> ValidationResult {
        let mut errs = ValidationErrors::default();
        self.metadata.validate(&mut errs, true);
        self.spec.devices.validate(&mut errs, "spec.devices");
        if let Err(status_errs) = self.status.validate() {
            errs.extend(status_errs);
        }
        errs.into_result()
    }
}

// ── Templates ─────────────────────────────────────────────────────

/// A namespaced blueprint from which per-workload claims are stamped out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTemplate {
    pub metadata: ObjectMeta,
    pub spec: ClaimTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTemplateSpec {
    pub spec: ClaimSpec,
}

impl ClaimTemplate {
    /// A fresh, unallocated claim in the template's namespace.
    pub fn instantiate(&self, name: impl Into<String>) -> Claim {
        Claim {
            metadata: ObjectMeta::namespaced(self.metadata.namespace.clone(), name),
            spec: self.spec.spec.clone(),
            status: ClaimStatus::default(),
        }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut errs = ValidationErrors::default();
        self.metadata.validate(&mut errs, true);
        self.spec.spec.devices.validate(&mut errs, "spec.spec.devices");
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn exact(class: &str) -> RequestKind {
        RequestKind::Exactly(ExactDeviceRequest::for_class(class))
    }

    fn gpu_claim() -> Claim {
        Claim::new(
            ObjectMeta::namespaced("ml", "train"),
            DeviceClaim {
                requests: vec![DeviceRequest {
                    name: "gpu".to_string(),
                    kind: exact("gpu-basic"),
                }],
                ..DeviceClaim::default()
            },
        )
    }

    fn taint(key: &str, value: &str, effect: TaintEffect) -> DeviceTaint {
        DeviceTaint {
            key: key.to_string(),
            value: value.to_string(),
            effect,
            time_added: Some(0),
        }
    }

    #[test]
    fn valid_claim_passes() {
        assert_eq!(gpu_claim().validate(), Ok(()));
    }

    #[test]
    fn request_kind_serializes_as_single_member() {
        let json = serde_json::to_value(gpu_claim()).unwrap();
        let req = &json["spec"]["devices"]["requests"][0];
        assert_eq!(req["exactly"]["deviceClassName"], "gpu-basic");
        assert!(req.get("firstAvailable").is_none());
    }

    #[test]
    fn request_with_both_members_rejected() {
        let bad = r#"{"name":"gpu","exactly":{"deviceClassName":"a"},"firstAvailable":[]}"#;
        assert!(serde_json::from_str::<DeviceRequest>(bad).is_err());
        let none = r#"{"name":"gpu"}"#;
        assert!(serde_json::from_str::<DeviceRequest>(none).is_err());
    }

    #[test]
    fn first_available_round_trips() {
        let doc = r#"{"name":"gpu","firstAvailable":[
            {"name":"large","deviceClassName":"gpu-large"},
            {"name":"small","deviceClassName":"gpu-small","count":2}]}"#;
        let req: DeviceRequest = serde_json::from_str(doc).unwrap();
        let RequestKind::FirstAvailable(subs) = &req.kind else {
            panic!("expected firstAvailable");
        };
        assert_eq!(subs[1].request.count(), 2);
        let back: DeviceRequest = serde_json::from_value(serde_json::to_value(&req).unwrap()).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn full_claim_round_trips() {
        let claim: Claim = serde_json::from_value(serde_json::json!({
            "metadata": {"namespace": "ml", "name": "train"},
            "spec": {"devices": {
                "requests": [
                    {"name": "gpu", "exactly": {
                        "deviceClassName": "gpu",
                        "count": 2,
                        "selectors": [{"cel": {"expression": "device.attributes[\"gpu.example.com\"].model == \"a100\""}}],
                        "tolerations": [
                            {"key": "gpu-maint", "operator": "Exists", "effect": "NoExecute", "tolerationSeconds": 60},
                            {"key": "tier", "value": "batch", "effect": "NoSchedule"}
                        ]
                    }},
                    {"name": "nic", "exactly": {"deviceClassName": "nic", "allocationMode": "All", "adminAccess": true}}
                ],
                "constraints": [{"requests": ["gpu", "nic"], "matchAttribute": "gpu.example.com/numa"}],
                "config": [{"requests": ["gpu"], "opaque": {
                    "driver": "gpu.example.com",
                    "parameters": {"sharing": {"strategy": "TimeSlicing"}}
                }}]
            }}
        }))
        .unwrap();
        let back: Claim = serde_json::from_value(serde_json::to_value(&claim).unwrap()).unwrap();
        assert_eq!(back, claim);
        assert_eq!(back.spec.devices.constraints.len(), 1);
        let RequestKind::Exactly(gpu) = &back.spec.devices.requests[0].kind else {
            panic!("expected exactly");
        };
        assert_eq!(gpu.tolerations[0].toleration_seconds, Some(60));
        assert_eq!(gpu.tolerations[1].operator, TolerationOperator::Equal);
    }

    #[test]
    fn count_defaults_to_one_and_must_be_positive() {
        let mut claim = gpu_claim();
        let RequestKind::Exactly(e) = &mut claim.spec.devices.requests[0].kind else {
            unreachable!()
        };
        assert_eq!(e.count(), 1);
        e.count = Some(0);
        assert!(claim.validate().is_err());
    }

    #[test]
    fn count_forbidden_with_all_mode() {
        let mut claim = gpu_claim();
        let RequestKind::Exactly(e) = &mut claim.spec.devices.requests[0].kind else {
            unreachable!()
        };
        e.allocation_mode = AllocationMode::All;
        e.count = Some(2);
        assert!(claim.validate().is_err());
    }

    #[test]
    fn too_many_requests_rejected() {
        let mut claim = gpu_claim();
        claim.spec.devices.requests = (0..33)
            .map(|i| DeviceRequest {
                name: format!("r{i}"),
                kind: exact("gpu-basic"),
            })
            .collect();
        let errs = claim.validate().unwrap_err();
        assert!(errs.iter().any(|e| matches!(
            e,
            ValidationError::TooMany { max: 32, actual: 33, .. }
        )));
    }

    #[test]
    fn first_available_is_capped_at_eight() {
        let mut claim = gpu_claim();
        claim.spec.devices.requests[0].kind = RequestKind::FirstAvailable(
            (0..9)
                .map(|i| DeviceSubRequest {
                    name: format!("s{i}"),
                    request: ExactDeviceRequest::for_class("gpu-basic"),
                })
                .collect(),
        );
        assert!(claim.validate().is_err());
    }

    #[test]
    fn admin_access_forbidden_on_alternatives() {
        let mut claim = gpu_claim();
        let mut sub = ExactDeviceRequest::for_class("gpu-basic");
        sub.admin_access = Some(true);
        claim.spec.devices.requests[0].kind = RequestKind::FirstAvailable(vec![DeviceSubRequest {
            name: "a".to_string(),
            request: sub,
        }]);
        assert!(claim.validate().is_err());
    }

    #[test]
    fn oversized_cel_expression_rejected() {
        let mut claim = gpu_claim();
        let RequestKind::Exactly(e) = &mut claim.spec.devices.requests[0].kind else {
            unreachable!()
        };
        e.selectors.push(DeviceSelector::cel("x".repeat(CEL_EXPRESSION_MAX_LENGTH + 1)));
        assert!(claim.validate().is_err());
    }

    #[test]
    fn constraint_references_must_exist() {
        let mut claim = gpu_claim();
        claim.spec.devices.constraints.push(DeviceConstraint {
            requests: vec!["nic".to_string()],
            match_attribute: Some("example.com/numa".to_string()),
        });
        assert!(claim.validate().is_err());
        claim.spec.devices.constraints[0].requests = vec!["gpu".to_string()];
        assert_eq!(claim.validate(), Ok(()));
    }

    #[test]
    fn match_attribute_must_be_fully_qualified() {
        let mut claim = gpu_claim();
        claim.spec.devices.constraints.push(DeviceConstraint {
            requests: Vec::new(),
            match_attribute: Some("numa".to_string()),
        });
        assert!(claim.validate().is_err());
    }

    #[test]
    fn subrequest_references_resolve() {
        let mut claim = gpu_claim();
        claim.spec.devices.requests[0].kind = RequestKind::FirstAvailable(vec![DeviceSubRequest {
            name: "large".to_string(),
            request: ExactDeviceRequest::for_class("gpu-large"),
        }]);
        assert!(claim.spec.devices.reference_exists("gpu"));
        assert!(claim.spec.devices.reference_exists("gpu/large"));
        assert!(!claim.spec.devices.reference_exists("gpu/small"));
    }

    #[test]
    fn reference_matching() {
        assert!(reference_matches("gpu", "gpu"));
        assert!(reference_matches("gpu", "gpu/large"));
        assert!(!reference_matches("gpu", "gpux"));
        assert!(!reference_matches("gpu/large", "gpu"));
    }

    #[test]
    fn opaque_parameters_must_be_an_object() {
        let mut claim = gpu_claim();
        claim.spec.devices.config.push(DeviceClaimConfiguration {
            requests: Vec::new(),
            config: DeviceConfiguration::opaque("gpu.example.com", serde_json::json!([1, 2])),
        });
        assert!(claim.validate().is_err());
    }

    #[test]
    fn config_serializes_with_opaque_key() {
        let c = DeviceClaimConfiguration {
            requests: vec!["gpu".to_string()],
            config: DeviceConfiguration::opaque("gpu.example.com", serde_json::json!({"mig": true})),
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["opaque"]["driver"], "gpu.example.com");
        assert_eq!(json["requests"][0], "gpu");
    }

    #[test]
    fn toleration_operator_defaults_to_equal() {
        let t: DeviceToleration = serde_json::from_str(r#"{"key":"k","value":"v"}"#).unwrap();
        assert_eq!(t.operator, TolerationOperator::Equal);
    }

    #[test]
    fn toleration_matching_rules() {
        let maint = taint("gpu-maint", "true", TaintEffect::NoExecute);

        let exists = DeviceToleration {
            key: "gpu-maint".to_string(),
            operator: TolerationOperator::Exists,
            ..DeviceToleration::default()
        };
        assert!(exists.tolerates(&maint));

        let equal_wrong = DeviceToleration {
            key: "gpu-maint".to_string(),
            value: "false".to_string(),
            ..DeviceToleration::default()
        };
        assert!(!equal_wrong.tolerates(&maint));

        let wildcard = DeviceToleration {
            operator: TolerationOperator::Exists,
            ..DeviceToleration::default()
        };
        assert!(wildcard.tolerates(&maint));

        let other_effect = DeviceToleration {
            key: "gpu-maint".to_string(),
            operator: TolerationOperator::Exists,
            effect: Some(TaintEffect::NoSchedule),
            ..DeviceToleration::default()
        };
        assert!(!other_effect.tolerates(&maint));
    }

    #[test]
    fn empty_key_requires_exists() {
        let mut claim = gpu_claim();
        let RequestKind::Exactly(e) = &mut claim.spec.devices.requests[0].kind else {
            unreachable!()
        };
        e.tolerations.push(DeviceToleration::default());
        assert!(claim.validate().is_err());
    }

    #[test]
    fn template_instantiates_in_its_namespace() {
        let template = ClaimTemplate {
            metadata: ObjectMeta::namespaced("ml", "gpu-template"),
            spec: ClaimTemplateSpec {
                spec: gpu_claim().spec,
            },
        };
        assert_eq!(template.validate(), Ok(()));
        let claim = template.instantiate("train-0");
        assert_eq!(claim.key(), "ml/train-0");
        assert_eq!(claim.spec, template.spec.spec);
        assert!(claim.status.allocation.is_none());
    }
}
