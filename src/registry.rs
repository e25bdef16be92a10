// src/registry.rs
use crate::crypto::KeyImage;
use crate::error::MixerResult;
use crate::repository::Repository;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome of a key-image insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    FirstSeen,
    Duplicate,
}

/// Process-wide set of spent key images. Insert-only during normal operation;
/// an image reappearing is the double-spend signal. The repository is the
/// durable source of truth, the in-memory set is a read-through cache that is
/// hydrated once at startup.
#[derive(Clone)]
pub struct KeyImageRegistry {
    repository: Arc<dyn Repository>,
    cache: Arc<RwLock<HashSet<String>>>,
}

impl KeyImageRegistry {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            cache: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Rehydrates the cache from the repository. Called once on startup so
    /// the registry survives process restarts.
    pub async fn load(&self) -> MixerResult<usize> {
        let images = self.repository.load_key_images().await?;
        let mut cache = self.cache.write().await;
        let count = images.len();
        cache.extend(images);
        log::info!("key image registry hydrated with {count} entries");
        Ok(count)
    }

    /// Insert-if-absent. Concurrent inserts of the same image collapse to a
    /// single winner; the loser observes `Duplicate`.
    pub async fn try_insert(&self, image: &KeyImage) -> MixerResult<InsertOutcome> {
        let hex = image.to_hex();
        {
            // fast path: already known locally
            let cache = self.cache.read().await;
            if cache.contains(&hex) {
                return Ok(InsertOutcome::Duplicate);
            }
        }
        // repository insert decides races between concurrent callers
        let inserted = self.repository.insert_key_image(&hex).await?;
        self.cache.write().await.insert(hex);
        if inserted {
            Ok(InsertOutcome::FirstSeen)
        } else {
            Ok(InsertOutcome::Duplicate)
        }
    }

    pub async fn contains(&self, image: &KeyImage) -> bool {
        self.cache.read().await.contains(&image.to_hex())
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

/// Banned participant ids with expiry. Registrations from banned ids are
/// rejected until the TTL lapses.
#[derive(Clone)]
pub struct BanList {
    repository: Arc<dyn Repository>,
    bans: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
}

impl BanList {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            bans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn load(&self) -> MixerResult<usize> {
        let persisted = self.repository.load_bans().await?;
        let mut bans = self.bans.write().await;
        let now = chrono::Utc::now();
        let mut count = 0;
        for (id, until) in persisted {
            if until > now {
                bans.insert(id, until);
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn ban(&self, participant_id: &str, duration: chrono::Duration) -> MixerResult<()> {
        let until = chrono::Utc::now() + duration;
        log::warn!("banning participant {participant_id} until {until}");
        self.repository.upsert_ban(participant_id, until).await?;
        self.bans
            .write()
            .await
            .insert(participant_id.to_string(), until);
        Ok(())
    }

    pub async fn is_banned(&self, participant_id: &str) -> bool {
        let bans = self.bans.read().await;
        match bans.get(participant_id) {
            Some(until) => *until > chrono::Utc::now(),
            None => false,
        }
    }

    /// Drops lapsed bans from memory and the repository. Invoked by the
    /// retention janitor.
    pub async fn sweep_expired(&self) -> MixerResult<usize> {
        let now = chrono::Utc::now();
        let expired: Vec<String> = {
            let bans = self.bans.read().await;
            bans.iter()
                .filter(|(_, until)| **until <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &expired {
            self.repository.delete_ban(id).await?;
        }
        let mut bans = self.bans.write().await;
        for id in &expired {
            bans.remove(id);
        }
        Ok(expired.len())
    }
}
