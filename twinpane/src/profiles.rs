use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use twinpane_core::backend::SshAuth;
use twinpane_core::{SourceConfig, SourceProfile};
use twinpane_integrations::ids::LOCAL_PROFILE;

use crate::settings::expand_with_home;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profiles from {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to write profiles to {path}: {source}")]
    Write { path: String, source: io::Error },
    #[error("invalid profile file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("profile {0:?} is defined more than once")]
    Duplicate(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<SourceProfile>,
}

/// Named source profiles stored as JSON. A `local` profile always exists.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
    profiles: Vec<SourceProfile>,
}

impl ProfileStore {
    /// Reads `path`; a missing file yields only the built-in profile.
    pub async fn load(path: &Path) -> Result<Self, ProfileError> {
        let display = path.display().to_string();
        let file = match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice::<ProfileFile>(&raw).map_err(|source| {
                ProfileError::Parse {
                    path: display.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => ProfileFile::default(),
            Err(source) => {
                return Err(ProfileError::Read {
                    path: display,
                    source,
                });
            }
        };
        Self::from_profiles(path.to_path_buf(), file.profiles)
    }

    pub fn from_profiles(
        path: PathBuf,
        profiles: Vec<SourceProfile>,
    ) -> Result<Self, ProfileError> {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        let mut store = Self {
            path,
            profiles: Vec::with_capacity(profiles.len() + 1),
        };
        for mut profile in profiles {
            if store.get(&profile.name).is_some() {
                return Err(ProfileError::Duplicate(profile.name));
            }
            expand_profile_paths(&mut profile, &home);
            store.profiles.push(profile);
        }
        if store.get(LOCAL_PROFILE).is_none() {
            store.profiles.insert(
                0,
                SourceProfile::new(LOCAL_PROFILE, SourceConfig::Local { home: None }),
            );
        }
        Ok(store)
    }

    pub fn get(&self, name: &str) -> Option<&SourceProfile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    pub fn profiles(&self) -> &[SourceProfile] {
        &self.profiles
    }

    /// Adds or replaces the profile with the same name.
    pub fn upsert(&mut self, mut profile: SourceProfile) {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        expand_profile_paths(&mut profile, &home);
        match self.profiles.iter_mut().find(|existing| existing.name == profile.name) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<SourceProfile> {
        let index = self.profiles.iter().position(|profile| profile.name == name)?;
        Some(self.profiles.remove(index))
    }

    pub async fn save(&self) -> Result<(), ProfileError> {
        let display = self.path.display().to_string();
        let file = ProfileFile {
            profiles: self.profiles.clone(),
        };
        let raw = serde_json::to_vec_pretty(&file).map_err(|source| ProfileError::Parse {
            path: display.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ProfileError::Write {
                    path: display.clone(),
                    source,
                })?;
        }
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|source| ProfileError::Write {
                path: display,
                source,
            })
    }
}

fn expand_profile_paths(profile: &mut SourceProfile, home: &Path) {
    let expand = |value: &mut String| {
        if value.starts_with('~') {
            *value = expand_with_home(value, home).display().to_string();
        }
    };
    match &mut profile.config {
        SourceConfig::Local { home: Some(path) } => expand(path),
        SourceConfig::Sftp {
            auth: SshAuth::Key { key_path, .. },
            ..
        } => expand(key_path),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use twinpane_core::SourceKind;

    #[tokio::test]
    async fn missing_file_has_only_local_profile() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::load(&dir.path().join("sources.json"))
            .await
            .unwrap();
        assert_eq!(store.profiles().len(), 1);
        assert_eq!(
            store.get(LOCAL_PROFILE).unwrap().config.kind(),
            SourceKind::Local
        );
    }

    #[tokio::test]
    async fn saves_and_reloads_profiles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/sources.json");
        let mut store = ProfileStore::load(&path).await.unwrap();
        store.upsert(SourceProfile::new(
            "mirror",
            SourceConfig::Ftp {
                host: "ftp.example.org".into(),
                port: 21,
                username: "anonymous".into(),
                password: String::new(),
                home: Some("/pub".into()),
                pool_size: Some(2),
            },
        ));
        store.save().await.unwrap();

        let reloaded = ProfileStore::load(&path).await.unwrap();
        assert_eq!(reloaded.profiles().len(), 2);
        assert_eq!(reloaded.get("mirror"), store.get("mirror"));

        let mut reloaded = reloaded;
        assert!(reloaded.remove("mirror").is_some());
        assert!(reloaded.get("mirror").is_none());
    }

    #[tokio::test]
    async fn rejects_duplicates_and_bad_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sources.json");
        tokio::fs::write(
            &path,
            r#"{"profiles": [{"name": "a", "type": "local"}, {"name": "a", "type": "local"}]}"#,
        )
        .await
        .unwrap();
        assert!(matches!(
            ProfileStore::load(&path).await,
            Err(ProfileError::Duplicate(name)) if name == "a"
        ));

        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(matches!(
            ProfileStore::load(&path).await,
            Err(ProfileError::Parse { .. })
        ));
    }

    #[test]
    fn expands_home_in_paths() {
        let mut profile = SourceProfile::new(
            "box",
            SourceConfig::Sftp {
                host: "box".into(),
                port: 22,
                username: "ann".into(),
                auth: SshAuth::Key {
                    key_path: "~/.ssh/id_ed25519".into(),
                    passphrase: None,
                },
                home: None,
                pool_size: None,
            },
        );
        expand_profile_paths(&mut profile, Path::new("/home/ann"));
        assert!(matches!(
            &profile.config,
            SourceConfig::Sftp { auth: SshAuth::Key { key_path, .. }, .. }
                if key_path == "/home/ann/.ssh/id_ed25519"
        ));
    }
}
