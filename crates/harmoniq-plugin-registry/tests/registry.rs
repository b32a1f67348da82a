use std::fs;

use harmoniq_plugin_registry::{
    DescriptorStore, ManifestProber, PluginDescriptor, PluginFormat, Registry, RegistryError,
    ScanConfig,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

#[test]
fn scanned_descriptors_are_cached_between_sessions() {
    let dir = tempdir().expect("tempdir");
    let plugins = dir.path().join("clap");
    fs::create_dir_all(&plugins).expect("plugin dir");
    let binary = plugins.join("dynamics.clap");
    fs::write(&binary, b"").expect("binary");
    fs::write(
        plugins.join("dynamics.json"),
        serde_json::json!({
            "plugins": [
                { "id": "acme.compressor", "name": "Compressor", "latency_samples": 16 },
                { "id": "acme.limiter", "name": "Limiter", "latency_samples": 64 }
            ]
        })
        .to_string(),
    )
    .expect("manifest");
    let cache = dir.path().join("cache.json");

    {
        let registry = Registry::with_store(DescriptorStore::open(&cache).expect("store"));
        let report = registry
            .scan(&ScanConfig::with_roots([plugins.clone()]), &ManifestProber)
            .expect("scan");
        assert_eq!(report.descriptors.len(), 2);
        assert!(report.errors.is_empty());
    }

    let registry = Registry::with_store(DescriptorStore::open(&cache).expect("store"));
    assert_eq!(registry.len(), 2);
    let entries = registry.find_by_path(&binary);
    let ids: Vec<_> = entries.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["acme.compressor", "acme.limiter"]);
    assert_eq!(
        registry.require("acme.limiter").expect("limiter").declared_latency_samples,
        64
    );
}

#[test]
fn unknown_ids_are_reported() {
    let registry = Registry::new();
    assert!(registry.is_empty());
    assert!(matches!(
        registry.require("missing"),
        Err(RegistryError::UnknownPlugin(id)) if id == "missing"
    ));

    let inserted = registry
        .insert(PluginDescriptor::new(
            "acme.gain",
            "Gain",
            "Acme",
            PluginFormat::Clap,
            "/opt/acme/gain.clap",
        ))
        .expect("insert without store");
    assert_eq!(registry.get("acme.gain").expect("present").name, inserted.name);
    assert!(registry.remove("acme.gain").is_some());
    assert!(registry.get("acme.gain").is_none());
}
