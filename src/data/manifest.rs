//! LEAF-style JSON manifests mapping user ids to image files and labels.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use super::DataError;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Manifest {
    /// The user ids, in the order their datasets are built.
    pub users: Vec<String>,
    #[serde(default)]
    pub num_samples: Vec<usize>,
    pub user_data: HashMap<String, UserData>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UserData {
    /// Image file names, relative to the image directory.
    pub x: Vec<String>,
    pub y: Vec<i64>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let content = fs::read_to_string(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_str(&content).map_err(|source| DataError::Manifest {
                path: path.to_path_buf(),
                source,
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// The data of every distinct user, in manifest order.
    pub fn iter_users(&self) -> impl Iterator<Item = (&str, &UserData)> + '_ {
        let mut seen = HashSet::new();
        self.users
            .iter()
            .filter(move |user| seen.insert(user.as_str()))
            .filter_map(move |user| self.user_data.get(user).map(|data| (user.as_str(), data)))
    }

    fn validate(&self) -> Result<(), DataError> {
        for user in &self.users {
            let data = self
                .user_data
                .get(user)
                .ok_or_else(|| DataError::MissingUser(user.clone()))?;
            if data.x.len() != data.y.len() {
                return Err(DataError::LabelCountMismatch {
                    context: format!("user {}", user),
                    images: data.x.len(),
                    labels: data.y.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    fn write_manifest(content: &str) -> std::path::PathBuf {
        let dir = env::temp_dir().join(format!("fedrun-manifest-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("manifest.json");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_manifest() {
        let path = write_manifest(
            r#"{
                "users": ["b", "a", "b"],
                "num_samples": [1, 2],
                "user_data": {
                    "a": {"x": ["1.jpg", "2.jpg"], "y": [0, 1]},
                    "b": {"x": ["3.jpg"], "y": [1]}
                }
            }"#,
        );
        let manifest = Manifest::load(&path).unwrap();
        let users: Vec<&str> = manifest.iter_users().map(|(user, _)| user).collect();
        assert_eq!(users, vec!["b", "a"]);
        assert_eq!(manifest.user_data["a"].y, vec![0, 1]);
    }

    #[test]
    fn test_invalid_manifests() {
        let path = write_manifest(r#"{"users": ["a"], "user_data": {}}"#);
        assert!(matches!(Manifest::load(&path), Err(DataError::MissingUser(user)) if user == "a"));

        let path = write_manifest(r#"{"users": ["a"], "user_data": {"a": {"x": ["1.jpg"], "y": []}}}"#);
        assert!(matches!(
            Manifest::load(&path),
            Err(DataError::LabelCountMismatch { images: 1, labels: 0, .. })
        ));

        let path = write_manifest("{not json");
        assert!(matches!(Manifest::load(&path), Err(DataError::Manifest { .. })));
    }
}
