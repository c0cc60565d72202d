use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::limits::*;
use crate::model::*;

/// The venue directory as the reservation engine sees it.
pub trait ResourceDirectory: Send + Sync {
    fn listing(&self, id: ResourceId) -> Option<ResourceListing>;

    fn listings(&self) -> Vec<ResourceListing>;

    fn listings_for_owner(&self, owner_id: UserId) -> Vec<ResourceListing> {
        self.listings()
            .into_iter()
            .filter(|l| l.owner_id == owner_id)
            .collect()
    }

    fn rate(&self, id: ResourceId) -> Option<Decimal> {
        self.listing(id).map(|l| l.rate_per_hour)
    }

    fn is_approved(&self, id: ResourceId) -> bool {
        self.listing(id).is_some_and(|l| l.approved)
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory snapshot io: {0}")]
    Io(#[from] io::Error),
    #[error("directory snapshot format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("invalid listing: {0}")]
    Invalid(&'static str),
}

/// In-process mirror of the venue directory, fed by the directory sync surface.
///
/// With a snapshot path every upsert rewrites a JSON file (temp file + rename),
/// so listings survive restarts alongside the reservation WAL.
pub struct InMemoryDirectory {
    listings: DashMap<ResourceId, ResourceListing>,
    snapshot: Option<PathBuf>,
    write_lock: std::sync::Mutex<()>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            listings: DashMap::new(),
            snapshot: None,
            write_lock: std::sync::Mutex::new(()),
        }
    }

    /// Load the snapshot at `path` if it exists and persist further upserts there.
    pub fn open(path: &Path) -> Result<Self, DirectoryError> {
        let listings = DashMap::new();
        match File::open(path) {
            Ok(f) => {
                let loaded: Vec<ResourceListing> = serde_json::from_reader(BufReader::new(f))?;
                for l in loaded {
                    listings.insert(l.id, l);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            listings,
            snapshot: Some(path.to_path_buf()),
            write_lock: std::sync::Mutex::new(()),
        })
    }

    pub fn upsert(&self, listing: ResourceListing) -> Result<(), DirectoryError> {
        if listing.name.len() > MAX_NAME_LEN || listing.category.len() > MAX_NAME_LEN {
            return Err(DirectoryError::Invalid("name too long"));
        }
        if listing.rate_per_hour.is_sign_negative() {
            return Err(DirectoryError::Invalid("negative rate"));
        }
        if listing.rate_per_hour > Decimal::from(MAX_RATE_PER_HOUR) {
            return Err(DirectoryError::Invalid("rate too large"));
        }
        if !self.listings.contains_key(&listing.id) && self.listings.len() >= MAX_LISTINGS {
            return Err(DirectoryError::Invalid("too many listings"));
        }
        self.listings.insert(listing.id, listing);
        self.persist()
    }

    fn persist(&self) -> Result<(), DirectoryError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all = self.listings();
        all.sort_by_key(|l| l.id);

        let tmp = path.with_extension("json.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, &all)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl ResourceDirectory for InMemoryDirectory {
    fn listing(&self, id: ResourceId) -> Option<ResourceListing> {
        self.listings.get(&id).map(|e| e.value().clone())
    }

    fn listings(&self) -> Vec<ResourceListing> {
        self.listings.iter().map(|e| e.value().clone()).collect()
    }
}
