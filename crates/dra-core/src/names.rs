//! Identifier format checks shared by all objects.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationErrors;

pub const DNS_LABEL_MAX_LENGTH: usize = 63;
pub const DNS_SUBDOMAIN_MAX_LENGTH: usize = 253;
pub const DRIVER_NAME_MAX_LENGTH: usize = 63;
pub const POOL_NAME_MAX_LENGTH: usize = DNS_SUBDOMAIN_MAX_LENGTH;
/// Maximum length of the domain prefix in a qualified name.
pub const DEVICE_MAX_DOMAIN_LENGTH: usize = 63;
/// Maximum length of the identifier part of a qualified name.
pub const DEVICE_MAX_ID_LENGTH: usize = 32;
pub const LABEL_VALUE_MAX_LENGTH: usize = 63;

static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));
static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static regex")
});
static C_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));
static LABEL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("static regex")
});

/// Split `domain/id` into its parts. Names without a slash have no domain.
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((domain, id)) => (Some(domain), id),
        None => (None, name),
    }
}

pub fn validate_dns_label(errs: &mut ValidationErrors, field: &str, value: &str) {
    if value.is_empty() {
        errs.required(field);
        return;
    }
    if value.len() > DNS_LABEL_MAX_LENGTH {
        errs.too_long(field, DNS_LABEL_MAX_LENGTH, value.len());
    }
    if !DNS_LABEL.is_match(value) {
        errs.invalid(field, value, "must be a lowercase RFC 1123 label");
    }
}

pub fn validate_dns_subdomain(errs: &mut ValidationErrors, field: &str, value: &str) {
    if value.is_empty() {
        errs.required(field);
        return;
    }
    if value.len() > DNS_SUBDOMAIN_MAX_LENGTH {
        errs.too_long(field, DNS_SUBDOMAIN_MAX_LENGTH, value.len());
    }
    if !DNS_SUBDOMAIN.is_match(value) {
        errs.invalid(field, value, "must be a lowercase RFC 1123 subdomain");
    }
}

pub fn validate_driver_name(errs: &mut ValidationErrors, field: &str, value: &str) {
    if value.len() > DRIVER_NAME_MAX_LENGTH {
        errs.too_long(field, DRIVER_NAME_MAX_LENGTH, value.len());
    }
    validate_dns_subdomain(errs, field, value);
}

/// Pool names are one or more DNS subdomains separated by slashes.
pub fn validate_pool_name(errs: &mut ValidationErrors, field: &str, value: &str) {
    if value.is_empty() {
        errs.required(field);
        return;
    }
    if value.len() > POOL_NAME_MAX_LENGTH {
        errs.too_long(field, POOL_NAME_MAX_LENGTH, value.len());
    }
    for part in value.split('/') {
        if part.is_empty() || !DNS_SUBDOMAIN.is_match(part) {
            errs.invalid(field, value, "each slash-separated part must be a DNS subdomain");
            return;
        }
    }
}

pub fn validate_c_identifier(errs: &mut ValidationErrors, field: &str, value: &str) {
    if value.is_empty() {
        errs.required(field);
        return;
    }
    if value.len() > DEVICE_MAX_ID_LENGTH {
        errs.too_long(field, DEVICE_MAX_ID_LENGTH, value.len());
    }
    if !C_IDENTIFIER.is_match(value) {
        errs.invalid(field, value, "must be a C identifier");
    }
}

fn validate_domain(errs: &mut ValidationErrors, field: &str, domain: &str) {
    if domain.len() > DEVICE_MAX_DOMAIN_LENGTH {
        errs.too_long(field, DEVICE_MAX_DOMAIN_LENGTH, domain.len());
    }
    validate_dns_subdomain(errs, field, domain);
}

/// Attribute and capacity names: `id` or `domain/id`.
pub fn validate_qualified_name(errs: &mut ValidationErrors, field: &str, value: &str) {
    let (domain, id) = split_qualified(value);
    if let Some(domain) = domain {
        validate_domain(errs, field, domain);
    }
    validate_c_identifier(errs, field, id);
}

/// Like [`validate_qualified_name`] but the domain is mandatory.
pub fn validate_fully_qualified_name(errs: &mut ValidationErrors, field: &str, value: &str) {
    match split_qualified(value) {
        (Some(domain), id) => {
            validate_domain(errs, field, domain);
            validate_c_identifier(errs, field, id);
        }
        (None, _) => errs.invalid(field, value, "must include a domain prefix"),
    }
}

/// Label names (taint keys, condition types): optional subdomain prefix and
/// a name of at most 63 characters.
pub fn validate_label_name(errs: &mut ValidationErrors, field: &str, value: &str) {
    let (prefix, name) = split_qualified(value);
    if let Some(prefix) = prefix {
        validate_dns_subdomain(errs, field, prefix);
    }
    if name.is_empty() {
        errs.required(field);
        return;
    }
    if name.len() > DNS_LABEL_MAX_LENGTH {
        errs.too_long(field, DNS_LABEL_MAX_LENGTH, name.len());
    }
    if !LABEL_TOKEN.is_match(name) {
        errs.invalid(field, value, "must consist of alphanumerics, '-', '_' or '.'");
    }
}

pub fn validate_label_value(errs: &mut ValidationErrors, field: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    if value.len() > LABEL_VALUE_MAX_LENGTH {
        errs.too_long(field, LABEL_VALUE_MAX_LENGTH, value.len());
    }
    if !LABEL_TOKEN.is_match(value) {
        errs.invalid(field, value, "must consist of alphanumerics, '-', '_' or '.'");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(f: fn(&mut ValidationErrors, &str, &str), value: &str) -> bool {
        let mut errs = ValidationErrors::default();
        f(&mut errs, "f", value);
        errs.is_empty()
    }

    #[test]
    fn dns_labels() {
        assert!(check(validate_dns_label, "gpu-0"));
        assert!(!check(validate_dns_label, "GPU"));
        assert!(!check(validate_dns_label, "-gpu"));
        assert!(!check(validate_dns_label, ""));
        assert!(!check(validate_dns_label, &"a".repeat(64)));
    }

    #[test]
    fn driver_names_are_short_subdomains() {
        assert!(check(validate_driver_name, "gpu.example.com"));
        assert!(!check(validate_driver_name, &format!("{}.com", "a".repeat(61))));
    }

    #[test]
    fn pool_names_allow_slashes() {
        assert!(check(validate_pool_name, "node-1"));
        assert!(check(validate_pool_name, "rack-a/node-1"));
        assert!(!check(validate_pool_name, "rack-a//node-1"));
        assert!(!check(validate_pool_name, "Rack"));
    }

    #[test]
    fn qualified_names() {
        assert!(check(validate_qualified_name, "model"));
        assert!(check(validate_qualified_name, "gpu.example.com/memory_gb"));
        assert!(!check(validate_qualified_name, "gpu.example.com/9lives"));
        assert!(!check(validate_qualified_name, &"x".repeat(33)));
    }

    #[test]
    fn fully_qualified_names_need_domain() {
        assert!(check(validate_fully_qualified_name, "gpu.example.com/numa"));
        assert!(!check(validate_fully_qualified_name, "numa"));
    }

    #[test]
    fn label_names_and_values() {
        assert!(check(validate_label_name, "example.com/maintenance"));
        assert!(check(validate_label_name, "gpu-maint"));
        assert!(!check(validate_label_name, "bad key"));
        assert!(check(validate_label_value, ""));
        assert!(check(validate_label_value, "v1.2"));
        assert!(!check(validate_label_value, "-x"));
    }

    #[test]
    fn split_qualified_handles_both_forms() {
        assert_eq!(split_qualified("a.com/x"), (Some("a.com"), "x"));
        assert_eq!(split_qualified("x"), (None, "x"));
    }
}
