//! Template storage collaborator: template sources, shared parts, and
//! fixture files on local disk.
//!
//! The engine only ever goes through [`TemplateStore`]; [`DiskStore`] is the
//! directory-backed implementation used by the editing tools. Layout under
//! the store root:
//!
//! ```text
//! templates/<handle>/main.liquid
//! templates/<handle>/config.json          (optional, orders text parts)
//! templates/<handle>/parts/<name>.liquid
//! templates/<handle>/tests/<handle>_test.yml
//! shared_parts/<name>.liquid
//! shared_parts.json                       (used-in + per-environment ids)
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A template's source text: the main document plus its ordered text parts.
#[derive(Debug, Clone, Default)]
pub struct TemplateSource {
    pub main: String,
    pub parts: Vec<(String, String)>,
}

impl TemplateSource {
    /// Wrap a standalone text (a shared part has no parts of its own).
    pub fn from_single(text: impl Into<String>) -> Self {
        TemplateSource {
            main: text.into(),
            parts: Vec::new(),
        }
    }

    /// Main text followed by every part text, in declared order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.main.as_str()).chain(self.parts.iter().map(|(_, text)| text.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.main.trim().is_empty() && self.parts.iter().all(|(_, text)| text.trim().is_empty())
    }
}

/// Storage operations the engine depends on.
pub trait TemplateStore {
    /// Read a template's source, fresh from storage. `None` when the handle
    /// has no local template.
    fn read_template_source(&self, handle: &str) -> Result<Option<TemplateSource>>;

    /// Read a shared part's source text.
    fn read_shared_part_source(&self, name: &str) -> Result<Option<String>>;

    /// Read the template's test fixture document, if one exists.
    fn read_fixture_text(&self, handle: &str) -> Result<Option<String>>;

    /// Persist a fixture document to the template's test location without
    /// clobbering an existing file: a numeric suffix is appended until the
    /// name is free. Returns the path written.
    fn write_fixture_text(&self, handle: &str, text: &str) -> Result<PathBuf>;

    /// Names of the shared parts a template declares it uses.
    fn shared_parts_used_by(&self, handle: &str) -> Result<Vec<String>>;

    /// Platform id of a shared part in one environment, for bundling its
    /// content into a run payload.
    fn resolve_shared_part_id(&self, environment: &str, name: &str) -> Result<Option<u64>>;
}

#[derive(Deserialize, Default)]
struct TemplateConfig {
    #[serde(default)]
    parts: Vec<String>,
}

#[derive(Deserialize, Default)]
struct SharedPartEntry {
    #[serde(default)]
    ids: BTreeMap<String, u64>,
    #[serde(default)]
    used_in: Vec<String>,
}

/// Directory-backed [`TemplateStore`].
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskStore { root: root.into() }
    }

    fn template_dir(&self, handle: &str) -> PathBuf {
        self.root.join("templates").join(handle)
    }

    fn tests_dir(&self, handle: &str) -> PathBuf {
        self.template_dir(handle).join("tests")
    }

    fn fixture_path(&self, handle: &str) -> PathBuf {
        self.tests_dir(handle).join(format!("{handle}_test.yml"))
    }

    fn shared_part_path(&self, name: &str) -> PathBuf {
        self.root.join("shared_parts").join(format!("{name}.liquid"))
    }

    fn registry(&self) -> Result<BTreeMap<String, SharedPartEntry>> {
        let path = self.root.join("shared_parts.json");
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    fn read_optional(path: &Path) -> Result<Option<String>> {
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn part_names(&self, handle: &str) -> Result<Vec<String>> {
        let config_path = self.template_dir(handle).join("config.json");
        if let Some(text) = Self::read_optional(&config_path)? {
            let config: TemplateConfig =
                serde_json::from_str(&text).with_context(|| format!("parse {}", config_path.display()))?;
            return Ok(config.parts);
        }
        // No config: fall back to the directory listing, sorted for
        // determinism.
        let parts_dir = self.template_dir(handle).join("parts");
        if !parts_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&parts_dir).with_context(|| format!("list {}", parts_dir.display()))? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(".liquid") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl TemplateStore for DiskStore {
    fn read_template_source(&self, handle: &str) -> Result<Option<TemplateSource>> {
        let main_path = self.template_dir(handle).join("main.liquid");
        let Some(main) = Self::read_optional(&main_path)? else {
            return Ok(None);
        };
        let mut parts = Vec::new();
        for name in self.part_names(handle)? {
            let part_path = self.template_dir(handle).join("parts").join(format!("{name}.liquid"));
            match Self::read_optional(&part_path)? {
                Some(text) => parts.push((name, text)),
                None => tracing::warn!(handle, part = %name, "declared part has no source file"),
            }
        }
        Ok(Some(TemplateSource { main, parts }))
    }

    fn read_shared_part_source(&self, name: &str) -> Result<Option<String>> {
        Self::read_optional(&self.shared_part_path(name))
    }

    fn read_fixture_text(&self, handle: &str) -> Result<Option<String>> {
        Self::read_optional(&self.fixture_path(handle))
    }

    fn write_fixture_text(&self, handle: &str, text: &str) -> Result<PathBuf> {
        let dir = self.tests_dir(handle);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let mut path = self.fixture_path(handle);
        let mut suffix = 1u32;
        while path.exists() {
            suffix += 1;
            path = dir.join(format!("{handle}_test_{suffix}.yml"));
        }
        fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    fn shared_parts_used_by(&self, handle: &str) -> Result<Vec<String>> {
        let registry = self.registry()?;
        Ok(registry
            .into_iter()
            .filter(|(_, entry)| entry.used_in.iter().any(|h| h == handle))
            .map(|(name, _)| name)
            .collect())
    }

    fn resolve_shared_part_id(&self, environment: &str, name: &str) -> Result<Option<u64>> {
        let registry = self.registry()?;
        Ok(registry
            .get(name)
            .and_then(|entry| entry.ids.get(environment))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_template(handle: &str, main: &str) -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = DiskStore::new(dir.path());
        let template_dir = dir.path().join("templates").join(handle);
        fs::create_dir_all(&template_dir).expect("create template dir");
        fs::write(template_dir.join("main.liquid"), main).expect("write main");
        (dir, store)
    }

    #[test]
    fn missing_template_reads_as_none() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = DiskStore::new(dir.path());
        assert!(store.read_template_source("ghost").expect("read").is_none());
    }

    #[test]
    fn parts_follow_config_order() {
        let (dir, store) = store_with_template("alpha", "{{ 1 }}");
        let template_dir = dir.path().join("templates").join("alpha");
        fs::write(
            template_dir.join("config.json"),
            r#"{"parts": ["second", "first"]}"#,
        )
        .expect("write config");
        let parts_dir = template_dir.join("parts");
        fs::create_dir_all(&parts_dir).expect("create parts dir");
        fs::write(parts_dir.join("first.liquid"), "one").expect("write part");
        fs::write(parts_dir.join("second.liquid"), "two").expect("write part");

        let source = store
            .read_template_source("alpha")
            .expect("read")
            .expect("template exists");
        let names: Vec<&str> = source.parts.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["second", "first"]);
    }

    #[test]
    fn fixture_writes_avoid_collisions() {
        let (_dir, store) = store_with_template("alpha", "{{ 1 }}");
        let first = store.write_fixture_text("alpha", "a: 1\n").expect("write");
        let second = store.write_fixture_text("alpha", "b: 2\n").expect("write");
        let third = store.write_fixture_text("alpha", "c: 3\n").expect("write");
        assert!(first.ends_with("alpha_test.yml"));
        assert!(second.ends_with("alpha_test_2.yml"));
        assert!(third.ends_with("alpha_test_3.yml"));
        // The canonical read still sees the first document.
        assert_eq!(
            store.read_fixture_text("alpha").expect("read").expect("fixture"),
            "a: 1\n"
        );
    }

    #[test]
    fn shared_part_registry_round_trips() {
        let (dir, store) = store_with_template("alpha", "{{ 1 }}");
        fs::write(
            dir.path().join("shared_parts.json"),
            r#"{
                "totals": {"ids": {"live": 77}, "used_in": ["alpha", "beta"]},
                "notes": {"ids": {}, "used_in": ["beta"]}
            }"#,
        )
        .expect("write registry");

        assert_eq!(store.shared_parts_used_by("alpha").expect("lookup"), vec!["totals"]);
        assert_eq!(
            store.resolve_shared_part_id("live", "totals").expect("resolve"),
            Some(77)
        );
        assert_eq!(store.resolve_shared_part_id("dev", "totals").expect("resolve"), None);
        assert_eq!(store.resolve_shared_part_id("live", "ghost").expect("resolve"), None);
    }
}
