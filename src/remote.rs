use thiserror::Error;

/// Failures from the remote blob store.
///
/// `NotFound` is its own variant so callers can tell "the master file
/// does not exist yet" apart from a transport failure; both are handled
/// by skipping, but the distinction matters for logging and tests.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The path does not exist in the remote store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was sent but the store rejected it.
    #[error("Remote store returned {status} for {path}")]
    Api { path: String, status: u16 },

    /// The request never completed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The response body was not in the expected shape.
    #[error("Malformed response: {0}")]
    Decode(String),

    /// No usable credentials, or the token exchange failed.
    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl From<reqwest::Error> for BlobError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for BlobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Metadata for a remote file, as much of it as the store exposes.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub path: String,
    pub size: Option<u64>,
}

/// One entry from a folder listing.
#[derive(Debug, Clone)]
pub struct FolderEntry {
    pub name: String,
    pub path: String,
}

/// The blob-store operations the observation store depends on.
///
/// Implementations must give `upload` overwrite semantics and must
/// follow continuation cursors in `list_folder` so folders larger than
/// one page are listed in full. Tests substitute an in-memory fake.
#[allow(async_fn_in_trait)]
pub trait BlobStore {
    async fn get_metadata(&self, path: &str) -> Result<Metadata, BlobError>;

    async fn download(&self, path: &str) -> Result<Vec<u8>, BlobError>;

    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError>;

    async fn list_folder(&self, path: &str) -> Result<Vec<FolderEntry>, BlobError>;

    /// Create (or fetch an existing) shared link for a file. Not used by
    /// the merge core; only for surfacing photo links to callers.
    async fn create_shared_link(&self, path: &str) -> Result<String, BlobError>;
}
