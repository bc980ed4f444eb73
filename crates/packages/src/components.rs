//! Multi-component package splitting. Components live in depth-1
//! subdirectories of `components/`; each becomes its own sub-package.

use pko_core::FileMap;

use crate::{RawPackage, COMPONENTS_DIR};

/// A component's name plus its file subtree (component-relative paths).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFiles {
    pub name: String,
    pub files: FileMap,
}

/// Split `components/<name>/...` subtrees out of the package. Returns the
/// root files (everything else, minus the components dir) and the
/// components in name order. Stray plain files directly under
/// `components/` are returned separately so validation can reject them.
pub fn split_components(raw: &RawPackage) -> (FileMap, Vec<ComponentFiles>, Vec<String>) {
    let prefix = format!("{COMPONENTS_DIR}/");
    let mut root = FileMap::new();
    let mut by_component: std::collections::BTreeMap<String, FileMap> = Default::default();
    let mut stray = Vec::new();

    for (path, data) in raw.files() {
        let Some(rest) = path.strip_prefix(&prefix) else {
            root.insert(path.clone(), data.clone());
            continue;
        };
        match rest.split_once('/') {
            Some((component, inner)) if !inner.is_empty() => {
                by_component
                    .entry(component.to_string())
                    .or_default()
                    .insert(inner.to_string(), data.clone());
            }
            // A bare file directly under components/ has no component to
            // belong to. Dot-files never get here; import drops them.
            _ => stray.push(path.clone()),
        }
    }

    let components = by_component
        .into_iter()
        .map(|(name, files)| ComponentFiles { name, files })
        .collect();
    (root, components, stray)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_root_and_components() {
        let raw = RawPackage::from_files(FileMap::from([
            ("manifest.yaml".to_string(), b"root".to_vec()),
            ("components/db/manifest.yaml".to_string(), b"db".to_vec()),
            ("components/db/deploy/sts.yaml".to_string(), b"sts".to_vec()),
            ("components/web/manifest.yaml".to_string(), b"web".to_vec()),
        ]))
        .unwrap();
        let (root, components, stray) = split_components(&raw);
        assert_eq!(root.len(), 1);
        assert!(stray.is_empty());
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].name, "db");
        assert_eq!(components[0].files.len(), 2);
        assert_eq!(components[0].files["deploy/sts.yaml"], b"sts".to_vec());
        assert_eq!(components[1].name, "web");
    }

    #[test]
    fn stray_file_reported() {
        let raw = RawPackage::from_files(FileMap::from([
            ("manifest.yaml".to_string(), b"root".to_vec()),
            ("components/x.txt".to_string(), b"stray".to_vec()),
        ]))
        .unwrap();
        let (_, components, stray) = split_components(&raw);
        assert!(components.is_empty());
        assert_eq!(stray, vec!["components/x.txt".to_string()]);
    }

    #[test]
    fn dot_files_under_components_never_arrive() {
        let raw = RawPackage::from_files(FileMap::from([(
            "components/.keep".to_string(),
            b"".to_vec(),
        )]))
        .unwrap();
        let (_, components, stray) = split_components(&raw);
        assert!(components.is_empty());
        assert!(stray.is_empty());
    }
}
