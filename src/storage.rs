// Storage client: a small blocking HTTP client for a local IPFS (Kubo) node.
// It only moves files; chunking, pinning and replication all happen on the
// node. The `ContentStore` trait is what the rest of the crate depends on, so
// the controller can be driven by an in-memory store in tests.

use crate::error::{Error, Result};
use reqwest::blocking::{multipart, Client, Response};
use serde::Deserialize;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const DIRECTORY_MIME: &str = "application/x-directory";
const FILE_MIME: &str = "application/octet-stream";

/// Opaque handle returned by the storage network on upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        ContentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContentId {
    fn from(id: String) -> Self {
        ContentId(id)
    }
}

/// File transfer against a content-addressed store.
pub trait ContentStore {
    /// Liveness probe. Never errors; an unreachable node is just `false`.
    fn is_reachable(&self) -> bool;

    /// Upload everything under `path` and return the identifier of the root.
    fn upload_directory(&self, path: &Path) -> Result<ContentId>;

    /// Fetch the content behind `id` and write it as `target`.
    fn download(&self, id: &ContentId, target: &Path) -> Result<()>;
}

/// Client for the Kubo RPC API (`/api/v0`).
#[derive(Clone)]
pub struct IpfsClient {
    client: Client,
    base_url: String,
}

/// One line of the NDJSON stream returned by `add`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddEntry {
    name: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatResponse {
    #[serde(rename = "Type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsResponse {
    objects: Vec<LsObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsObject {
    #[serde(default)]
    links: Vec<LsLink>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsLink {
    name: String,
    hash: String,
    #[serde(rename = "Type")]
    kind: i32,
}

impl LsLink {
    // unixfs Directory (1) and HAMTShard (5)
    fn is_dir(&self) -> bool {
        self.kind == 1 || self.kind == 5
    }
}

/// Error body returned by Kubo on non-2xx responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    message: String,
}

/// A file or directory to send as one multipart part.
#[derive(Debug, PartialEq, Eq)]
struct UploadEntry {
    /// Path relative to the parent of the upload root, `/`-separated.
    name: String,
    path: PathBuf,
    is_dir: bool,
}

impl IpfsClient {
    /// Create a client for a node at `address` (`host:port` or a full URL).
    pub fn new(address: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {}", e)))?;
        Ok(IpfsClient {
            client,
            base_url: api_base(address),
        })
    }

    fn post(&self, command: &str, query: &[(&str, &str)]) -> Result<Response> {
        let url = format!("{}/{}", self.base_url, command);
        debug!(%url, ?query, "IPFS request");
        let res = self.client.post(&url).query(query).send()?;
        check(res)
    }

    fn upload(&self, path: &Path) -> Result<ContentId> {
        let entries = collect_entries(path)?;
        let root = entries
            .first()
            .map(|e| e.name.clone())
            .ok_or_else(|| Error::Upload(format!("nothing to upload at {}", path.display())))?;

        let mut form = multipart::Form::new();
        for entry in &entries {
            let part = if entry.is_dir {
                multipart::Part::bytes(Vec::new()).mime_str(DIRECTORY_MIME)?
            } else {
                multipart::Part::file(&entry.path)?.mime_str(FILE_MIME)?
            };
            form = form.part("file", part.file_name(entry.name.clone()));
        }

        let url = format!("{}/add", self.base_url);
        let res = self
            .client
            .post(&url)
            .query(&[("recursive", "true"), ("pin", "true"), ("progress", "false")])
            .multipart(form)
            .send()?;
        let body = check(res)?.text()?;
        let cid = root_hash(&body, &root)?;

        info!(path = %path.display(), files = entries.len(), %cid, "Uploaded to IPFS");
        Ok(cid)
    }

    fn fetch(&self, id: &ContentId, target: &Path) -> Result<()> {
        let ipfs_path = format!("/ipfs/{}", id);
        let stat: StatResponse = self.post("files/stat", &[("arg", &ipfs_path)])?.json()?;
        if stat.kind == "directory" {
            self.fetch_dir(id, target)
        } else {
            self.fetch_file(id, target)
        }
    }

    fn fetch_dir(&self, id: &ContentId, target: &Path) -> Result<()> {
        fs::create_dir_all(target)?;
        let listing: LsResponse = self.post("ls", &[("arg", id.as_str())])?.json()?;
        for link in listing.objects.into_iter().flat_map(|o| o.links) {
            if !is_safe_name(&link.name) {
                return Err(Error::Download(format!("refusing entry name {:?}", link.name)));
            }
            let child = ContentId::new(link.hash.clone());
            let child_path = target.join(&link.name);
            if link.is_dir() {
                self.fetch_dir(&child, &child_path)?;
            } else {
                self.fetch_file(&child, &child_path)?;
            }
        }
        Ok(())
    }

    fn fetch_file(&self, id: &ContentId, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut res = self.post("cat", &[("arg", id.as_str())])?;
        let mut file = File::create(target)?;
        let bytes = res.copy_to(&mut file)?;
        debug!(%id, path = %target.display(), bytes, "Wrote file");
        Ok(())
    }
}

impl ContentStore for IpfsClient {
    fn is_reachable(&self) -> bool {
        match self.post("id", &[]) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "IPFS liveness probe failed");
                false
            }
        }
    }

    fn upload_directory(&self, path: &Path) -> Result<ContentId> {
        self.upload(path)
            .map_err(|e| Error::Upload(format!("{}: {}", path.display(), e)))
    }

    fn download(&self, id: &ContentId, target: &Path) -> Result<()> {
        self.fetch(id, target)
            .map_err(|e| Error::Download(format!("{}: {}", id, e)))?;
        info!(%id, path = %target.display(), "Downloaded from IPFS");
        Ok(())
    }
}

/// Normalise `host:port` or a URL into the `/api/v0` base.
fn api_base(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    let with_scheme = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    if with_scheme.ends_with("/api/v0") {
        with_scheme
    } else {
        format!("{}/api/v0", with_scheme)
    }
}

fn check(res: Response) -> Result<Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status().as_u16();
    let txt = res.text().unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&txt)
        .map(|e| e.message)
        .unwrap_or(txt);
    Err(Error::Storage { status, message })
}

/// Walk `root` depth-first. Directories come before their children and
/// siblings are sorted by name so the upload order is stable. Symbolic
/// links below the root are skipped.
fn collect_entries(root: &Path) -> Result<Vec<UploadEntry>> {
    let root = fs::canonicalize(root)?;
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Upload(format!("cannot name upload root {}", root.display())))?
        .to_string();
    let mut entries = Vec::new();
    walk(&root, name, &mut entries)?;
    Ok(entries)
}

fn walk(path: &Path, name: String, entries: &mut Vec<UploadEntry>) -> Result<()> {
    // Links are not followed; a link back to an ancestor would never end.
    let file_type = fs::symlink_metadata(path)?.file_type();
    if file_type.is_symlink() {
        warn!(path = %path.display(), "Skipping symbolic link");
        return Ok(());
    }
    let is_dir = file_type.is_dir();
    entries.push(UploadEntry {
        name: name.clone(),
        path: path.to_path_buf(),
        is_dir,
    });
    if !is_dir {
        return Ok(());
    }

    let mut children: Vec<_> = fs::read_dir(path)?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|c| c.file_name());
    for child in children {
        let child_name = child.file_name().to_string_lossy().into_owned();
        walk(&child.path(), format!("{}/{}", name, child_name), entries)?;
    }
    Ok(())
}

/// Pick the hash of the upload root out of the `add` NDJSON stream, falling
/// back to the last entry the node reported.
fn root_hash(body: &str, root: &str) -> Result<ContentId> {
    let mut last = None;
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let entry: AddEntry = serde_json::from_str(line)
            .map_err(|e| Error::InvalidResponse(format!("add output {:?}: {}", line, e)))?;
        if entry.name == root {
            return Ok(ContentId::new(entry.hash));
        }
        last = Some(entry.hash);
    }
    last.map(ContentId::new)
        .ok_or_else(|| Error::InvalidResponse("empty add response".into()))
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
