//! Label subtraction and host-config passthrough rules for recreate-style
//! updates.

use std::collections::HashMap;

use serde_json::Value;

/// `new_labels = container_labels − (old_image_labels − new_image_labels)`,
/// as set subtraction on key-value *pairs*: a container label survives when
/// its value diverged from the old image's, or when the key still exists in
/// the new image with any value. Labels inherited from the old image that
/// vanished from the new image are dropped; user and orchestration labels
/// (Compose, Traefik, …) pass through untouched.
pub fn subtract_labels(
    container_labels: &HashMap<String, String>,
    old_image_labels: &HashMap<String, String>,
    new_image_labels: &HashMap<String, String>,
) -> HashMap<String, String> {
    container_labels
        .iter()
        .filter(|(key, value)| {
            match old_image_labels.get(*key) {
                // Inherited unchanged from the old image: keep only if the
                // new image still carries the key.
                Some(old_value) if old_value == *value => new_image_labels.contains_key(*key),
                // Diverged from the image default, or never an image label
                _ => true,
            }
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Podman rejects some Docker host-config fields: NanoCpus becomes
/// CpuPeriod/CpuQuota and MemorySwappiness is removed. Everything else in
/// the document passes through verbatim.
pub fn filter_host_config_for_podman(host_config: &Value) -> Value {
    let mut config = host_config.clone();
    let Some(obj) = config.as_object_mut() else {
        return config;
    };
    if let Some(nano_cpus) = obj.remove("NanoCpus").and_then(|v| v.as_i64()) {
        if nano_cpus > 0 {
            obj.insert("CpuPeriod".to_string(), Value::from(100_000));
            obj.insert("CpuQuota".to_string(), Value::from(nano_cpus / 10_000));
        }
    }
    obj.remove("MemorySwappiness");
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_stale_image_label_dropped() {
        let container = labels(&[("maintainer", "old team"), ("com.docker.compose.project", "shop")]);
        let old_image = labels(&[("maintainer", "old team")]);
        let new_image = labels(&[]);

        let result = subtract_labels(&container, &old_image, &new_image);
        // Inherited label whose key vanished from the new image is dropped
        assert!(!result.contains_key("maintainer"));
        // Orchestration label untouched
        assert_eq!(result.get("com.docker.compose.project").unwrap(), "shop");
    }

    #[test]
    fn test_user_override_of_image_label_preserved() {
        let container = labels(&[("maintainer", "customized")]);
        let old_image = labels(&[("maintainer", "upstream")]);
        let new_image = labels(&[]);

        let result = subtract_labels(&container, &old_image, &new_image);
        assert_eq!(result.get("maintainer").unwrap(), "customized");
    }

    #[test]
    fn test_label_persisting_in_new_image_kept() {
        let container = labels(&[("org.opencontainers.image.title", "nginx")]);
        let old_image = labels(&[("org.opencontainers.image.title", "nginx")]);
        let new_image = labels(&[("org.opencontainers.image.title", "nginx-updated")]);

        let result = subtract_labels(&container, &old_image, &new_image);
        assert!(result.contains_key("org.opencontainers.image.title"));
    }

    #[test]
    fn test_no_label_invented() {
        let container = labels(&[("a", "1")]);
        let old_image = labels(&[("b", "2")]);
        let new_image = labels(&[("c", "3")]);
        let result = subtract_labels(&container, &old_image, &new_image);
        // Every output label was on the container
        assert_eq!(result, labels(&[("a", "1")]));
    }

    #[test]
    fn test_podman_nanocpus_conversion() {
        let host_config = json!({
            "NanoCpus": 500_000_000i64,
            "MemorySwappiness": 60,
            "Binds": ["/data:/data"],
        });
        let filtered = filter_host_config_for_podman(&host_config);
        assert!(filtered.get("NanoCpus").is_none());
        assert!(filtered.get("MemorySwappiness").is_none());
        assert_eq!(filtered["CpuPeriod"], 100_000);
        assert_eq!(filtered["CpuQuota"], 50_000);
        // Untouched structural fields pass through verbatim
        assert_eq!(filtered["Binds"], json!(["/data:/data"]));
    }
}
