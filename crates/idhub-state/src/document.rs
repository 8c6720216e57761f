// Document store: one JSON file per entity, written with a version check
// under an exclusive lock file shared by every process using the directory.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use idhub_core::lease::{self, Caller};
use idhub_core::query::{Criterion, QuerySpec};
use idhub_core::{EntityStore, SharedClock, StatefulEntity, StoreError, StoreResult, WorkflowState};

use crate::memory::stale;
use crate::translate::CompiledQuery;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document<E> {
    version: u64,
    entity: E,
}

fn file_stem(id: &str) -> String {
    id.bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                char::from(b).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Collection<E> {
    dir: PathBuf,
    lock_path: PathBuf,
    _entity: PhantomData<fn() -> E>,
}

impl<E: StatefulEntity> Collection<E> {
    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(id)))
    }

    fn lock(&self) -> StoreResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(StoreError::unavailable)?;
        file.lock_exclusive().map_err(StoreError::unavailable)?;
        Ok(file)
    }

    fn read_path(path: &Path) -> StoreResult<Option<Document<E>>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(StoreError::unavailable),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::unavailable(err)),
        }
    }

    fn read(&self, id: &str) -> StoreResult<Option<Document<E>>> {
        Self::read_path(&self.path_for(id))
    }

    fn read_existing(&self, id: &str) -> StoreResult<Document<E>> {
        self.read(id)?
            .ok_or_else(|| StoreError::not_found(E::ENTITY_TYPE, id))
    }

    /// Writes `entity` as the version after `expected`, failing if the stored
    /// version moved. Callers hold the lock.
    fn write(&self, entity: &E, expected: Option<u64>) -> StoreResult<u64> {
        let current = self.read(entity.id())?.map(|doc| doc.version);
        if current != expected {
            return Err(stale::<E>(entity.id(), None));
        }
        let version = expected.map_or(1, |v| v + 1);
        let path = self.path_for(entity.id());
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&Document {
            version,
            entity: entity.clone(),
        })
        .map_err(StoreError::unavailable)?;
        fs::write(&tmp, bytes).map_err(StoreError::unavailable)?;
        fs::rename(&tmp, &path).map_err(StoreError::unavailable)?;
        Ok(version)
    }

    fn scan(&self) -> StoreResult<Vec<Document<E>>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::unavailable(err)),
        };
        let mut documents = Vec::new();
        for entry in entries {
            let path = entry.map_err(StoreError::unavailable)?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(document) = Self::read_path(&path)?
            {
                documents.push(document);
            }
        }
        Ok(documents)
    }
}

/// File-backed entity store using optimistic, version-checked writes.
#[derive(Debug, Clone)]
pub struct FileEntityStore<E> {
    collection: Collection<E>,
    clock: SharedClock,
}

impl<E: StatefulEntity> FileEntityStore<E> {
    /// Keeps documents under `<root>/<entity type>/`.
    pub fn open(root: impl AsRef<Path>, clock: SharedClock) -> StoreResult<Self> {
        let root = root.as_ref();
        let dir = root.join(E::ENTITY_TYPE);
        fs::create_dir_all(&dir).map_err(StoreError::unavailable)?;
        Ok(Self {
            collection: Collection {
                lock_path: root.join(format!("{}.lock", E::ENTITY_TYPE)),
                dir,
                _entity: PhantomData,
            },
            clock,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Collection<E>, &SharedClock) -> StoreResult<T> + Send + 'static,
    {
        let collection = self.collection.clone();
        let clock = self.clock.clone();
        tokio::task::spawn_blocking(move || op(&collection, &clock))
            .await
            .map_err(StoreError::unavailable)?
    }

    async fn overwrite(&self, entity: &E, owner: Option<String>, release: bool) -> StoreResult<()> {
        let entity = entity.clone();
        self.blocking(move |collection, clock| {
            let _guard = collection.lock()?;
            let now = clock.now();
            let stored = collection.read_existing(entity.id())?;
            let caller = owner.as_deref().map_or(Caller::Admin, Caller::LeaseOwner);
            lease::authorize_write(stored.entity.meta().lease.as_ref(), caller, now)
                .map_err(|conflict| stale::<E>(entity.id(), conflict))?;

            let mut next = entity;
            let meta = next.meta_mut();
            meta.created_at = stored.entity.meta().created_at;
            meta.updated_at = now;
            meta.lease = if release {
                None
            } else {
                stored.entity.meta().lease.clone()
            };
            collection.write(&next, Some(stored.version))?;
            Ok(())
        })
        .await
    }
}

fn owned(caller: Caller<'_>) -> Option<String> {
    match caller {
        Caller::LeaseOwner(owner) => Some(owner.to_string()),
        Caller::Admin => None,
    }
}

#[async_trait]
impl<E: StatefulEntity> EntityStore<E> for FileEntityStore<E> {
    async fn create(&self, entity: &E) -> StoreResult<()> {
        let mut entity = entity.clone();
        self.blocking(move |collection, clock| {
            let _guard = collection.lock()?;
            if collection.read(entity.id())?.is_some() {
                return Err(StoreError::duplicate(E::ENTITY_TYPE, entity.id()));
            }
            entity.meta_mut().lease = None;
            entity.meta_mut().updated_at = clock.now();
            collection.write(&entity, None)?;
            Ok(())
        })
        .await
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>> {
        let id = id.to_string();
        self.blocking(move |collection, _| Ok(collection.read(&id)?.map(|doc| doc.entity)))
            .await
    }

    async fn update(&self, entity: &E, caller: Caller<'_>) -> StoreResult<()> {
        self.overwrite(entity, owned(caller), false).await
    }

    async fn commit(&self, entity: &E, owner: &str) -> StoreResult<()> {
        self.overwrite(entity, Some(owner.to_string()), true).await
    }

    async fn release_lease(&self, id: &str, owner: &str) -> StoreResult<()> {
        let (id, owner) = (id.to_string(), owner.to_string());
        self.blocking(move |collection, clock| {
            let _guard = collection.lock()?;
            let mut stored = collection.read_existing(&id)?;
            lease::release(stored.entity.meta().lease.as_ref(), &owner, clock.now())
                .map_err(|conflict| stale::<E>(&id, Some(conflict)))?;
            stored.entity.meta_mut().lease = None;
            collection.write(&stored.entity, Some(stored.version))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str, caller: Caller<'_>) -> StoreResult<()> {
        let (id, owner) = (id.to_string(), owned(caller));
        self.blocking(move |collection, clock| {
            let _guard = collection.lock()?;
            let stored = collection.read_existing(&id)?;
            let caller = owner.as_deref().map_or(Caller::Admin, Caller::LeaseOwner);
            lease::authorize_write(stored.entity.meta().lease.as_ref(), caller, clock.now())
                .map_err(|conflict| stale::<E>(&id, conflict))?;
            fs::remove_file(collection.path_for(&id)).map_err(StoreError::unavailable)
        })
        .await
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<E>> {
        let query = CompiledQuery::compile::<E>(spec)?;
        let documents = self.blocking(|collection, _| collection.scan()).await?;
        query.apply(documents.into_iter().map(|doc| doc.entity))
    }

    async fn count(&self, filter: &[Criterion]) -> StoreResult<u64> {
        let query = CompiledQuery::filter::<E>(filter)?;
        let documents = self.blocking(|collection, _| collection.scan()).await?;
        query.count(documents.into_iter().map(|doc| doc.entity))
    }

    async fn claim_next(
        &self,
        max: usize,
        states: &[E::State],
        owner: &str,
        lease_duration: Duration,
    ) -> StoreResult<Vec<E>> {
        if max == 0 || states.is_empty() {
            return Ok(Vec::new());
        }
        let codes: Vec<i32> = states.iter().map(|state| state.code()).collect();
        let owner = owner.to_string();

        self.blocking(move |collection, clock| {
            // Pick candidates from an unlocked snapshot, then lease each one
            // only if its version is still the one we saw.
            let now = clock.now();
            let mut candidates: Vec<Document<E>> = collection
                .scan()?
                .into_iter()
                .filter(|doc| {
                    let meta = doc.entity.meta();
                    codes.contains(&meta.state) && lease::is_free(meta.lease.as_ref(), now)
                })
                .collect();
            candidates.sort_by(|a, b| {
                let (a, b) = (a.entity.meta(), b.entity.meta());
                (a.updated_at, a.created_at, &a.id).cmp(&(b.updated_at, b.created_at, &b.id))
            });

            let _guard = collection.lock()?;
            let now = clock.now();
            let mut claimed = Vec::new();
            for candidate in candidates {
                if claimed.len() >= max {
                    break;
                }
                let id = candidate.entity.id().to_string();
                let Some(current) = collection.read(&id)? else {
                    continue;
                };
                if current.version != candidate.version {
                    continue;
                }
                let Ok(granted) =
                    lease::try_acquire(current.entity.meta().lease.as_ref(), &owner, lease_duration, now)
                else {
                    continue;
                };
                let mut entity = current.entity;
                entity.meta_mut().lease = Some(granted);
                collection.write(&entity, Some(current.version))?;
                claimed.push(entity);
            }
            Ok(claimed)
        })
        .await
    }

    async fn acquire_lease(&self, id: &str, owner: &str, duration: Duration) -> StoreResult<bool> {
        let (id, owner) = (id.to_string(), owner.to_string());
        self.blocking(move |collection, clock| {
            let _guard = collection.lock()?;
            let mut stored = collection.read_existing(&id)?;
            match lease::try_acquire(stored.entity.meta().lease.as_ref(), &owner, duration, clock.now()) {
                Ok(granted) => {
                    stored.entity.meta_mut().lease = Some(granted);
                    collection.write(&stored.entity, Some(stored.version))?;
                    Ok(true)
                }
                Err(_) => Ok(false),
            }
        })
        .await
    }

    async fn is_leased_by(&self, id: &str, owner: &str) -> StoreResult<bool> {
        let (id, owner) = (id.to_string(), owner.to_string());
        self.blocking(move |collection, clock| {
            Ok(collection.read(&id)?.is_some_and(|doc| {
                lease::is_held_by(doc.entity.meta().lease.as_ref(), &owner, clock.now())
            }))
        })
        .await
    }
}
