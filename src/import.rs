//! Conversion of a foreign credential container into a [`Database`].
//!
//! The container backend only has to produce a [`ForeignGroup`] tree; the
//! mapping to folders and entries lives here. Nothing in this module touches
//! an already-open vault: the caller adopts [`ImportOutcome::database`] as a
//! whole or not at all.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::ImportLimits;
use crate::error::{VaultError, VaultResult};
use crate::models::{Database, Entry, Folder, ImportStats, new_uuid};

/// Title of metadata-only entries (KeePass 1.x meta streams).
pub const META_ENTRY_TITLE: &str = "Meta-Info";
pub const CUSTOM_FIELDS_BANNER: &str = "--- Custom Fields ---";

pub const FIELD_TITLE: &str = "Title";
pub const FIELD_USERNAME: &str = "UserName";
pub const FIELD_PASSWORD: &str = "Password";
pub const FIELD_URL: &str = "URL";
pub const FIELD_NOTES: &str = "Notes";

const KNOWN_FIELDS: [&str; 5] = [FIELD_TITLE, FIELD_USERNAME, FIELD_PASSWORD, FIELD_URL, FIELD_NOTES];

/// An entry as the foreign container stores it. `fields` keeps the
/// container's own iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignEntry {
    pub fields: Vec<(String, String)>,
    pub icon: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl ForeignEntry {
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignGroup {
    pub name: String,
    pub groups: Vec<ForeignGroup>,
    pub entries: Vec<ForeignEntry>,
}

impl ForeignGroup {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Opens a foreign container and hands back its root group.
pub trait ContainerOpener: Send + Sync {
    fn open(&self, container: &[u8], password: &str) -> VaultResult<ForeignGroup>;
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub database: Database,
    pub stats: ImportStats,
}

/// Cheap plausibility check on a candidate file, run before any decryption.
pub fn validate_candidate(file_name: &str, size: u64, limits: &ImportLimits) -> VaultResult<()> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    if !limits.extensions.iter().any(|known| known.eq_ignore_ascii_case(&extension)) {
        return Err(VaultError::Validation(format!(
            "unsupported file type '{file_name}', expected one of: {}",
            limits.extensions.join(", ")
        )));
    }
    if size < limits.min_bytes {
        return Err(VaultError::Validation(format!(
            "file is too small to be a password database ({size} bytes)"
        )));
    }
    if size > limits.max_bytes {
        return Err(VaultError::Validation(format!(
            "file exceeds the {} byte import limit ({size} bytes)",
            limits.max_bytes
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Importer {
    opener: Arc<dyn ContainerOpener>,
    limits: ImportLimits,
}

impl Importer {
    pub fn new(opener: Arc<dyn ContainerOpener>, limits: ImportLimits) -> Self {
        Self { opener, limits }
    }

    #[cfg(feature = "kdbx")]
    pub fn kdbx(limits: ImportLimits) -> Self {
        Self::new(Arc::new(crate::kdbx::KdbxOpener), limits)
    }

    pub fn limits(&self) -> &ImportLimits {
        &self.limits
    }

    /// Validates the candidate file, then imports it.
    pub fn import_file(
        &self,
        file_name: &str,
        container: &[u8],
        password: &str,
    ) -> VaultResult<ImportOutcome> {
        validate_candidate(file_name, container.len() as u64, &self.limits)?;
        self.import_database(container, password, file_name)
    }

    pub fn import_database(
        &self,
        container: &[u8],
        password: &str,
        source_file: &str,
    ) -> VaultResult<ImportOutcome> {
        if container.is_empty() {
            return Err(VaultError::Validation("import file is empty".to_string()));
        }
        if password.is_empty() {
            return Err(VaultError::Validation(
                "a password is required to open the database".to_string(),
            ));
        }

        let root = self.opener.open(container, password)?;
        let (database, stats) = convert(&root, source_file, Utc::now());
        info!(
            source = source_file,
            entries = stats.entries_imported,
            folders = stats.folders_imported,
            "import finished"
        );
        Ok(ImportOutcome { database, stats })
    }

    /// Blocking-pool variant. Dropping the returned future discards the
    /// result; nothing is shared with the caller until it resolves.
    pub async fn import_async(
        &self,
        file_name: String,
        container: Vec<u8>,
        password: String,
    ) -> VaultResult<ImportOutcome> {
        let importer = self.clone();
        let password = zeroize::Zeroizing::new(password);
        tokio::task::spawn_blocking(move || {
            importer.import_file(&file_name, &container, &password)
        })
        .await
        .map_err(|e| VaultError::Encryption(format!("worker task failed: {e}")))?
    }
}

struct Collected {
    folders: Vec<Folder>,
    entries: Vec<Entry>,
    skipped: usize,
}

fn convert(root: &ForeignGroup, source_file: &str, now: DateTime<Utc>) -> (Database, ImportStats) {
    let mut collected = Collected {
        folders: Vec::new(),
        entries: Vec::new(),
        skipped: 0,
    };
    collect_group(root, "", now, &mut collected);
    if collected.skipped > 0 {
        debug!(skipped = collected.skipped, "skipped metadata entries");
    }

    let folders = build_folder_tree(collected.folders);
    let database = Database {
        entries: collected.entries,
        folders,
    };
    let stats = ImportStats {
        entries_imported: database.entries.len(),
        folders_imported: database.folder_count(),
        source_file: source_file.to_string(),
    };
    (database, stats)
}

// First pass: a flat folder list carrying parent paths.
fn collect_group(group: &ForeignGroup, path: &str, now: DateTime<Utc>, out: &mut Collected) {
    for entry in &group.entries {
        match convert_entry(entry, path, now) {
            Some(converted) => out.entries.push(converted),
            None => out.skipped += 1,
        }
    }
    for child in &group.groups {
        let child_path = if path.is_empty() {
            child.name.clone()
        } else {
            format!("{path}/{}", child.name)
        };
        out.folders.push(Folder {
            id: new_uuid(),
            name: child.name.clone(),
            path: child_path.clone(),
            parent_path: path.to_string(),
            children: Vec::new(),
        });
        collect_group(child, &child_path, now, out);
    }
}

/// Second pass: attaches each folder under the folder whose `path` equals its
/// `parent_path`. Folders without a known parent end up at the top level.
pub fn build_folder_tree(flat: Vec<Folder>) -> Vec<Folder> {
    let mut by_path: HashMap<&str, usize> = HashMap::new();
    for (i, folder) in flat.iter().enumerate() {
        by_path.entry(folder.path.as_str()).or_insert(i);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); flat.len()];
    let mut top_level = Vec::new();
    for (i, folder) in flat.iter().enumerate() {
        let parent = if folder.parent_path.is_empty() {
            None
        } else {
            by_path.get(folder.parent_path.as_str()).copied()
        };
        match parent {
            Some(p) if p != i => children[p].push(i),
            _ => top_level.push(i),
        }
    }
    drop(by_path);

    let mut slots: Vec<Option<Folder>> = flat.into_iter().map(Some).collect();
    top_level
        .into_iter()
        .filter_map(|i| attach(i, &mut slots, &children))
        .collect()
}

fn attach(index: usize, slots: &mut [Option<Folder>], children: &[Vec<usize>]) -> Option<Folder> {
    let mut folder = slots[index].take()?;
    folder.children = children[index]
        .iter()
        .filter_map(|&child| attach(child, slots, children))
        .collect();
    Some(folder)
}

fn convert_entry(entry: &ForeignEntry, folder_path: &str, now: DateTime<Utc>) -> Option<Entry> {
    let title = entry.get(FIELD_TITLE).unwrap_or_default();
    if title == META_ENTRY_TITLE {
        return None;
    }

    let custom: Vec<String> = entry
        .fields
        .iter()
        .filter(|(key, _)| !KNOWN_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| format!("{key}: {value}"))
        .collect();
    let mut notes = entry.get(FIELD_NOTES).unwrap_or_default().to_string();
    if !custom.is_empty() {
        if !notes.is_empty() {
            notes.push_str("\n\n");
        }
        notes.push_str(CUSTOM_FIELDS_BANNER);
        notes.push('\n');
        notes.push_str(&custom.join("\n"));
    }

    let created_at = entry.created_at.unwrap_or(now);
    Some(Entry {
        id: new_uuid(),
        title: title.to_string(),
        username: entry.get(FIELD_USERNAME).unwrap_or_default().to_string(),
        password: entry.get(FIELD_PASSWORD).unwrap_or_default().to_string(),
        url: entry.get(FIELD_URL).unwrap_or_default().to_string(),
        notes,
        folder_path: folder_path.to_string(),
        icon: entry.icon.unwrap_or(0),
        created_at,
        modified_at: entry.modified_at.unwrap_or(created_at),
    })
}
