use crate::scene::EntityType;
use once_cell::sync::Lazy;
use serde::Serialize;
use siphasher::sip::SipHasher24;
use std::hash::{Hash, Hasher};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldManifestEntry {
    pub field: &'static str,
    pub field_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityManifestEntry {
    pub entity_type: &'static str,
    pub stable_hash: u64,
    pub fields: Vec<FieldManifestEntry>,
}

static CATALOG: Lazy<Vec<EntityManifestEntry>> = Lazy::new(|| {
    EntityType::all()
        .into_iter()
        .map(|entity_type| EntityManifestEntry {
            entity_type: entity_type.label(),
            stable_hash: stable_type_hash(entity_type.label()),
            fields: entity_type
                .field_table()
                .iter()
                .map(|(field, _)| FieldManifestEntry {
                    field: field.label(),
                    field_id: field.0,
                })
                .collect(),
        })
        .collect()
});

static SCHEMA_HASH: Lazy<u64> = Lazy::new(|| {
    let mut hasher = SipHasher24::new_with_keys(STABLE_HASH_KEY_0, STABLE_HASH_KEY_1);
    for entry in CATALOG.iter() {
        entry.entity_type.hash(&mut hasher);
        for field in &entry.fields {
            field.field_id.hash(&mut hasher);
            field.field.hash(&mut hasher);
        }
    }
    hasher.finish()
});

/// Replicated field catalog, one entry per entity type.
pub fn catalog() -> &'static [EntityManifestEntry] {
    &CATALOG
}

/// Fingerprint of the whole field catalog, carried in every packet header.
pub fn schema_hash() -> u64 {
    *SCHEMA_HASH
}

/// Computes the stable SipHash-2-4 identifier for the provided type label.
pub fn stable_type_hash(label: &str) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(STABLE_HASH_KEY_0, STABLE_HASH_KEY_1);
    label.hash(&mut hasher);
    hasher.finish()
}

const STABLE_HASH_KEY_0: u64 = 0x0ddcc001feedface;
const STABLE_HASH_KEY_1: u64 = 0xabcdef0123456789;

#[derive(Debug, Serialize)]
struct SchemaManifest<'a> {
    schema_hash: u64,
    entities: &'a [EntityManifestEntry],
}

/// Writes the manifest to the provided JSON file path.
pub fn write_manifest_json(path: &Path) -> std::io::Result<()> {
    let manifest = SchemaManifest {
        schema_hash: schema_hash(),
        entities: catalog(),
    };
    let json = serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?;
    std::fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    std::fs::write(path, json)
}

/// Returns the first entity type label whose hash collides with another, if any.
pub fn find_hash_collision() -> Option<&'static str> {
    let mut hashes = std::collections::HashSet::new();
    CATALOG
        .iter()
        .find(|entry| !hashes.insert(entry.stable_hash))
        .map(|entry| entry.entity_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        let hash_a = stable_type_hash("CylinderGeometry");
        let hash_b = stable_type_hash("CylinderGeometry");
        assert_eq!(hash_a, hash_b);
        assert_ne!(hash_a, stable_type_hash("TubeGeometry"));
    }

    #[test]
    fn catalog_has_no_collisions_or_duplicate_fields() {
        assert!(find_hash_collision().is_none());
        for entry in catalog() {
            let mut ids: Vec<u16> = entry.fields.iter().map(|f| f.field_id).collect();
            let before = ids.len();
            ids.sort();
            ids.dedup();
            assert_eq!(before, ids.len(), "{}", entry.entity_type);
        }
    }

    #[test]
    fn manifest_writes_to_disk() {
        let tmp_dir = tempfile::tempdir().expect("tmpdir");
        let path = tmp_dir.path().join("nested").join("manifest.json");
        write_manifest_json(&path).expect("write manifest");
        let contents = std::fs::read_to_string(path).expect("read manifest");
        assert!(contents.contains("CylinderGeometry"));
        assert!(contents.contains("parent_node"));
        assert!(contents.contains(&schema_hash().to_string()));
    }
}
