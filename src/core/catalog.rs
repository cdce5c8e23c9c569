use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::core::domain::Challenge;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid challenge content: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate challenge id {0:?}")]
    DuplicateId(String),
    #[error("challenge {index} has no id and the content has no topic id")]
    MissingId { index: usize },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContentFile {
    Topic {
        topic_id: String,
        challenges: Vec<Challenge>,
    },
    List(Vec<Challenge>),
}

/// Read-only challenge content, loaded once.
#[derive(Debug, Default)]
pub struct ChallengeCatalog {
    challenges: BTreeMap<String, Arc<Challenge>>,
}

impl ChallengeCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, CatalogError> {
        let (topic_id, challenges) = match serde_json::from_str(content)? {
            ContentFile::Topic {
                topic_id,
                challenges,
            } => (Some(topic_id), challenges),
            ContentFile::List(challenges) => (None, challenges),
        };

        let mut catalog = BTreeMap::new();
        for (index, mut challenge) in challenges.into_iter().enumerate() {
            if challenge.id.is_empty() {
                let Some(topic_id) = &topic_id else {
                    return Err(CatalogError::MissingId { index });
                };
                challenge.id = format!("{}-{}", topic_id, index + 1);
            }

            let id = challenge.id.clone();
            if catalog.insert(id.clone(), Arc::new(challenge)).is_some() {
                return Err(CatalogError::DuplicateId(id));
            }
        }

        tracing::debug!("Loaded {} challenges", catalog.len());
        Ok(Self {
            challenges: catalog,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Challenge>> {
        self.challenges.get(id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Challenge>> {
        self.challenges.values()
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}
