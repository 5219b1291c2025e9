use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use strum::{Display, EnumString};

/// The durable identity of a repository on its code host. This triple never
/// changes across renames, so it is the primary matching key when diffing.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ExternalRepoSpec {
    /// Host-assigned identifier, e.g. a GraphQL node id or numeric id.
    pub id: String,
    /// The type of host, e.g. "github".
    pub service_type: String,
    /// The instance, e.g. "https://github.com/".
    pub service_id: String,
}

impl ExternalRepoSpec {
    pub fn new(
        id: impl Into<String>,
        service_type: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service_type: service_type.into(),
            service_id: service_id.into(),
        }
    }

    pub fn is_set(&self) -> bool {
        !self.id.is_empty() && !self.service_type.is_empty() && !self.service_id.is_empty()
    }
}

impl fmt::Display for ExternalRepoSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} {} {}}}", self.service_id, self.service_type, self.id)
    }
}

/// One external service's view of a repository, keyed by the service URN in
/// [`Repo::sources`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: String,
    pub clone_url: String,
}

/// Bitmask of repository fields changed by a sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedFields(u64);

impl ModifiedFields {
    pub const NONE: ModifiedFields = ModifiedFields(0);
    pub const NAME: ModifiedFields = ModifiedFields(1 << 0);
    pub const URI: ModifiedFields = ModifiedFields(1 << 1);
    pub const DESCRIPTION: ModifiedFields = ModifiedFields(1 << 2);
    pub const EXTERNAL_REPO: ModifiedFields = ModifiedFields(1 << 3);
    pub const ARCHIVED: ModifiedFields = ModifiedFields(1 << 4);
    pub const FORK: ModifiedFields = ModifiedFields(1 << 5);
    pub const PRIVATE: ModifiedFields = ModifiedFields(1 << 6);
    pub const STARS: ModifiedFields = ModifiedFields(1 << 7);
    pub const METADATA: ModifiedFields = ModifiedFields(1 << 8);
    pub const SOURCES: ModifiedFields = ModifiedFields(1 << 9);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ModifiedFields) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ModifiedFields {
    type Output = ModifiedFields;

    fn bitor(self, rhs: ModifiedFields) -> ModifiedFields {
        ModifiedFields(self.0 | rhs.0)
    }
}

impl BitOrAssign for ModifiedFields {
    fn bitor_assign(&mut self, rhs: ModifiedFields) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ModifiedFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "unmodified");
        }

        let names = [
            (Self::NAME, "name"),
            (Self::URI, "uri"),
            (Self::DESCRIPTION, "description"),
            (Self::EXTERNAL_REPO, "external-repo"),
            (Self::ARCHIVED, "archived"),
            (Self::FORK, "fork"),
            (Self::PRIVATE, "private"),
            (Self::STARS, "stars"),
            (Self::METADATA, "metadata"),
            (Self::SOURCES, "sources"),
        ];

        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// The canonical repository record.
///
/// `id == 0` marks a record that has not been persisted yet; the store
/// assigns the id on insert. A row with `deleted_at` set is a tombstone and
/// is never revived: a later reappearance of the same external identity
/// creates a brand-new row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub name: String,
    pub uri: String,
    pub description: String,
    pub external_repo: ExternalRepoSpec,
    pub private: bool,
    pub archived: bool,
    pub fork: bool,
    pub stars: i64,
    /// Host-specific payload, stored as JSONB.
    pub metadata: serde_json::Value,
    /// One entry per external service that can see this repository.
    pub sources: HashMap<String, SourceInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Most recent clone/fetch error recorded against this repository, if
    /// any. Non-empty values make the repo a candidate for the pruner.
    pub last_error: Option<String>,
}

impl Default for Repo {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            uri: String::new(),
            description: String::new(),
            external_repo: ExternalRepoSpec::default(),
            private: false,
            archived: false,
            fork: false,
            stars: 0,
            metadata: serde_json::Value::Null,
            sources: HashMap::new(),
            created_at: DateTime::UNIX_EPOCH,
            updated_at: DateTime::UNIX_EPOCH,
            deleted_at: None,
            last_error: None,
        }
    }
}

impl Repo {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Marks the repository as a tombstone: the delete timestamp is set and
    /// all source associations are dropped.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) {
        self.deleted_at = Some(now);
        self.sources.clear();
    }

    /// Folds the name the way the uniqueness constraint does.
    pub fn folded_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Updates `self` with the fields of the newer observation `n`,
    /// returning the set of fields that changed.
    ///
    /// Names are compared case-insensitively: a pure-case rename updates the
    /// stored column but does not set the NAME bit. The external repo spec
    /// only overwrites an existing one when the observation carries a fully
    /// populated spec.
    pub fn update_from(&mut self, n: &Repo) -> ModifiedFields {
        let mut modified = ModifiedFields::NONE;

        if self.folded_name() != n.folded_name() {
            modified |= ModifiedFields::NAME;
        }
        if self.name != n.name {
            self.name = n.name.clone();
        }

        if self.uri != n.uri {
            self.uri = n.uri.clone();
            modified |= ModifiedFields::URI;
        }

        if self.description != n.description {
            self.description = n.description.clone();
            modified |= ModifiedFields::DESCRIPTION;
        }

        if n.external_repo.is_set() && self.external_repo != n.external_repo {
            self.external_repo = n.external_repo.clone();
            modified |= ModifiedFields::EXTERNAL_REPO;
        }

        if self.archived != n.archived {
            self.archived = n.archived;
            modified |= ModifiedFields::ARCHIVED;
        }

        if self.fork != n.fork {
            self.fork = n.fork;
            modified |= ModifiedFields::FORK;
        }

        if self.private != n.private {
            self.private = n.private;
            modified |= ModifiedFields::PRIVATE;
        }

        if self.stars != n.stars {
            self.stars = n.stars;
            modified |= ModifiedFields::STARS;
        }

        if self.metadata != n.metadata {
            self.metadata = n.metadata.clone();
            modified |= ModifiedFields::METADATA;
        }

        for (urn, info) in &n.sources {
            match self.sources.get(urn) {
                Some(old) if old == info => {}
                _ => {
                    self.sources.insert(urn.clone(), info.clone());
                    modified |= ModifiedFields::SOURCES;
                }
            }
        }

        modified
    }
}

/// The kind of code host or package registry behind an external service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalServiceKind {
    Github,
    Gitlab,
    BitbucketCloud,
    BitbucketServer,
    Gerrit,
    Perforce,
    Phabricator,
    AwsCodeCommit,
    AzureDevOps,
    Gitolite,
    Pagure,
    NpmPackages,
    GoModules,
    PythonPackages,
    RustPackages,
    RubyPackages,
    JvmPackages,
}

/// A configured connection to one code host or package registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalService {
    pub id: i64,
    pub kind: ExternalServiceKind,
    pub display_name: String,
    /// Host-specific connection settings (token, url, repo selection).
    pub config: serde_json::Value,
    /// Platform-managed shared service; never synced by customer paths.
    pub cloud_default: bool,
    /// Repositories sourced from this service default to non-private.
    pub unrestricted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ExternalService {
    /// Stable identifier used as the key in a repo's sources map.
    pub fn urn(&self) -> String {
        format!("extsvc:{}:{}", self.kind.to_string().to_lowercase(), self.id)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl Default for ExternalService {
    fn default() -> Self {
        Self {
            id: 0,
            kind: ExternalServiceKind::Github,
            display_name: String::new(),
            config: serde_json::Value::Null,
            cloud_default: false,
            unrestricted: false,
            created_at: DateTime::UNIX_EPOCH,
            updated_at: DateTime::UNIX_EPOCH,
            next_sync_at: None,
            last_sync_at: None,
            deleted_at: None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncJobState {
    Queued,
    Processing,
    Completed,
    Errored,
}

impl SyncJobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

/// A persisted unit of sync work. At most one non-terminal job may exist per
/// external service at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub external_service_id: i64,
    pub state: SyncJobState,
    pub failure_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A modified repository together with the fields that changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedRepo {
    pub repo: Repo,
    pub fields: ModifiedFields,
}

/// The classification of one observed batch against the stored catalog.
/// Transient: the sole channel between the diff engine, the store and the
/// observability layer, never persisted itself.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    pub added: Vec<Repo>,
    pub modified: Vec<ModifiedRepo>,
    pub deleted: Vec<Repo>,
    pub unmodified: Vec<Repo>,
}

impl Diff {
    /// True when the pass produced no catalog changes.
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len() + self.unmodified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorts every bucket by external identity for deterministic assertions.
    pub fn sort(&mut self) {
        self.added.sort_by(|a, b| a.external_repo.cmp(&b.external_repo));
        self.deleted.sort_by(|a, b| a.external_repo.cmp(&b.external_repo));
        self.unmodified.sort_by(|a, b| a.external_repo.cmp(&b.external_repo));
        self.modified
            .sort_by(|a, b| a.repo.external_repo.cmp(&b.repo.external_repo));
    }
}
