//! KeePass container backend for the importer.

use std::io::Cursor;

use keepass::db::{Entry as KeePassEntry, Group as KeePassGroup, Node};
use keepass::error::DatabaseOpenError;
use keepass::{Database, DatabaseKey};
use tracing::debug;

use crate::error::{VaultError, VaultResult};
use crate::import::{
    ContainerOpener, FIELD_NOTES, FIELD_PASSWORD, FIELD_TITLE, FIELD_URL, FIELD_USERNAME,
    ForeignEntry, ForeignGroup,
};

/// Opens `.kdbx` (3.x/4.x) and `.kdb` files with a password-only key.
#[derive(Debug, Clone, Copy, Default)]
pub struct KdbxOpener;

impl ContainerOpener for KdbxOpener {
    fn open(&self, container: &[u8], password: &str) -> VaultResult<ForeignGroup> {
        let key = DatabaseKey::new().with_password(password);
        let mut source = Cursor::new(container);
        let db = Database::open(&mut source, key).map_err(classify_open_error)?;
        Ok(convert_group(&db.root))
    }
}

fn classify_open_error(err: DatabaseOpenError) -> VaultError {
    match err {
        DatabaseOpenError::Key(e) => {
            debug!("keepass key rejected: {e}");
            VaultError::Authentication
        }
        DatabaseOpenError::UnsupportedVersion => VaultError::UnsupportedFormat(
            "this KeePass database version is not supported".to_string(),
        ),
        other => VaultError::Format(other.to_string()),
    }
}

fn convert_group(group: &KeePassGroup) -> ForeignGroup {
    let mut out = ForeignGroup::named(group.name.clone());
    for node in &group.children {
        match node {
            Node::Group(child) => out.groups.push(convert_group(child)),
            Node::Entry(entry) => out.entries.push(convert_entry(entry)),
        }
    }
    out
}

// keepass keeps fields in a hash map, so the file order is gone by the time we
// see them. Standard fields go first, custom ones alphabetically.
fn convert_entry(entry: &KeePassEntry) -> ForeignEntry {
    let mut keys: Vec<&String> = entry.fields.keys().collect();
    keys.sort_by_key(|key| (standard_rank(key), key.as_str()));
    let fields = keys
        .into_iter()
        .filter_map(|key| entry.get(key).map(|value| (key.clone(), value.to_string())))
        .collect();
    ForeignEntry {
        fields,
        icon: entry.icon_id.and_then(|id| u32::try_from(id).ok()),
        created_at: entry.times.get_creation().map(|t| t.and_utc()),
        modified_at: entry.times.get_last_modification().map(|t| t.and_utc()),
    }
}

fn standard_rank(key: &str) -> usize {
    [FIELD_TITLE, FIELD_USERNAME, FIELD_PASSWORD, FIELD_URL, FIELD_NOTES]
        .iter()
        .position(|known| *known == key)
        .unwrap_or(usize::MAX)
}
