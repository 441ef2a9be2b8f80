//! Hydrus Network client API store.

use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{FailureSink, MediaError, MediaStore};
use super::tls;
use crate::config::HydrusConfig;
use crate::fingerprint::VIDEO_FILETYPES;

const ACCESS_KEY_HEADER: &str = "Hydrus-Client-API-Access-Key";

/// Searched for in addition to the filetype tag and the configured query.
pub const DEFAULT_TAGS: [&str; 2] = [
    "system:has duration",
    "system:file service is not currently in trash",
];

/// `page_type` of a "files" page in `/manage_pages/get_pages`
const FILE_PAGE_TYPE: u64 = 6;

/// Service types a file search may be restricted to
const FILE_DOMAIN: u64 = 2;
const ALL_LOCAL_FILES: u64 = 15;

/// Relationship code for "potential duplicates"
const POTENTIAL_DUPLICATES: u8 = 0;

#[derive(Debug, Deserialize)]
struct ApiVersion {
    version: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hashes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PotentialsCount {
    potential_duplicates_count: u64,
}

pub struct HydrusClient {
    agent: ureq::Agent,
    base_url: String,
    access_key: String,
    file_service_keys: Vec<String>,
    filetypes: Vec<String>,
}

impl HydrusClient {
    /// Client for `config` that has not talked to Hydrus yet.
    pub fn new(config: &HydrusConfig) -> Result<Self, MediaError> {
        let access_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| MediaError::Config("Hydrus API key (HYDRUS_API_KEY)".to_string()))?;

        if config.verify_cert.is_none() && config.api_url.starts_with("https") {
            debug!("No certificate given; the client API certificate will not be verified");
        }
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .tls_config(tls::client_config(config.verify_cert.as_deref())?)
            .build();

        Ok(Self {
            agent,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            access_key,
            file_service_keys: config
                .file_service_keys
                .iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect(),
            filetypes: VIDEO_FILETYPES.iter().map(|t| t.to_string()).collect(),
        })
    }

    /// Only search for files of these Hydrus filetypes, usually the ones the
    /// hasher in use can decode.
    pub fn with_filetypes(mut self, filetypes: &[&str]) -> Self {
        self.filetypes = filetypes.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Build a client, check the connection and resolve the file services
    /// to search.
    pub fn connect(config: &HydrusConfig) -> Result<Self, MediaError> {
        let mut client = Self::new(config)?;
        let version = client.api_version()?;
        info!(version, url = %client.base_url, "Connected to Hydrus client API");

        let services = client.get_services()?;
        if client.file_service_keys.is_empty() {
            client.file_service_keys = vec![default_file_service(&services)?];
        } else {
            verify_file_services(&services, &client.file_service_keys)?;
        }
        Ok(client)
    }

    pub fn file_service_keys(&self) -> &[String] {
        &self.file_service_keys
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn get(&self, endpoint: &str) -> ureq::Request {
        self.agent
            .get(&self.url(endpoint))
            .set(ACCESS_KEY_HEADER, &self.access_key)
    }

    fn post(&self, endpoint: &str) -> ureq::Request {
        self.agent
            .post(&self.url(endpoint))
            .set(ACCESS_KEY_HEADER, &self.access_key)
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, MediaError> {
        let mut request = self.get(endpoint);
        for (name, value) in params {
            request = request.query(name, value);
        }
        let response = request.call().map_err(|e| request_error(endpoint, e))?;
        response.into_json().map_err(|e| MediaError::Response {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    fn post_json(&self, endpoint: &str, body: Value) -> Result<(), MediaError> {
        self.post(endpoint)
            .send_json(body)
            .map_err(|e| request_error(endpoint, e))?;
        Ok(())
    }

    pub fn api_version(&self) -> Result<u64, MediaError> {
        let version: ApiVersion = self.get_json("/api_version", &[])?;
        Ok(version.version)
    }

    pub fn get_services(&self) -> Result<Value, MediaError> {
        self.get_json("/get_services", &[])
    }

    pub fn get_pages(&self) -> Result<Value, MediaError> {
        self.get_json("/manage_pages/get_pages", &[])
    }

    pub fn add_files_to_page(&self, page_key: &str, hashes: &[&str]) -> Result<(), MediaError> {
        self.post_json(
            "/manage_pages/add_files",
            json!({ "page_key": page_key, "hashes": hashes }),
        )
    }
}

impl MediaStore for HydrusClient {
    fn list_ids(&self, query: &[String]) -> Result<Vec<String>, MediaError> {
        let tags = search_tags(&self.filetypes, query);
        debug!(?tags, "Searching Hydrus");

        let params = [
            ("tags", Value::from(tags).to_string()),
            (
                "file_service_keys",
                Value::from(self.file_service_keys.clone()).to_string(),
            ),
            ("return_hashes", "true".to_string()),
            ("return_file_ids", "false".to_string()),
        ];
        let response: SearchResponse = self.get_json("/get_files/search_files", &params)?;
        Ok(response.hashes)
    }

    fn fetch(&self, id: &str) -> Result<Vec<u8>, MediaError> {
        let endpoint = "/get_files/file";
        let response = self
            .get(endpoint)
            .query("hash", id)
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(404, _) => MediaError::NotFound(id.to_string()),
                e => request_error(endpoint, e),
            })?;

        let mut bytes = Vec::new();
        response.into_reader().read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn report_duplicate(&self, a: &str, b: &str) -> Result<(), MediaError> {
        self.post_json(
            "/manage_file_relationships/set_file_relationships",
            json!({
                "relationships": [{
                    "hash_a": a,
                    "hash_b": b,
                    "relationship": POTENTIAL_DUPLICATES,
                    "do_default_content_merge": true,
                }]
            }),
        )
    }

    fn count_duplicates(&self) -> Result<u64, MediaError> {
        let params = [(
            "file_service_keys",
            Value::from(self.file_service_keys.clone()).to_string(),
        )];
        let count: PotentialsCount =
            self.get_json("/manage_file_relationships/get_potentials_count", &params)?;
        Ok(count.potential_duplicates_count)
    }
}

/// Sends files that failed to fingerprint to a named Hydrus page so they can
/// be looked at by hand. The page must already exist.
pub struct HydrusPageLogger<'a> {
    client: &'a HydrusClient,
    page_name: String,
    page_key: Mutex<Option<String>>,
}

impl<'a> HydrusPageLogger<'a> {
    pub fn new(client: &'a HydrusClient, page_name: impl Into<String>) -> Self {
        Self {
            client,
            page_name: page_name.into(),
            page_key: Mutex::new(None),
        }
    }

    fn page_key(&self) -> Result<String, MediaError> {
        let mut cached = self
            .page_key
            .lock()
            .map_err(|_| MediaError::Transport("page key lock poisoned".to_string()))?;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let pages = self.client.get_pages()?;
        let key = find_page_key(&pages["pages"], &self.page_name)
            .ok_or_else(|| MediaError::NotFound(format!("page '{}'", self.page_name)))?;
        *cached = Some(key.clone());
        Ok(key)
    }
}

impl FailureSink for HydrusPageLogger<'_> {
    fn record_failure(&self, id: &str, reason: &str) {
        let result = self
            .page_key()
            .and_then(|page_key| self.client.add_files_to_page(&page_key, &[id]));
        match result {
            Ok(()) => debug!(file = id, page = %self.page_name, reason, "Sent failed file to page"),
            Err(e) => warn!(
                file = id,
                page = %self.page_name,
                error = %e,
                "Could not add failed file to Hydrus page; make sure the page exists"
            ),
        }
    }
}

fn request_error(endpoint: &str, err: ureq::Error) -> MediaError {
    match err {
        ureq::Error::Status(code, _) => MediaError::Status {
            endpoint: endpoint.to_string(),
            code,
        },
        ureq::Error::Transport(transport) => MediaError::Transport(transport.to_string()),
    }
}

fn search_tags(filetypes: &[String], query: &[String]) -> Vec<String> {
    let filetype_tag = format!("system:filetype={}", filetypes.join(", "));
    std::iter::once(filetype_tag)
        .chain(DEFAULT_TAGS.iter().map(|tag| tag.to_string()))
        .chain(
            query
                .iter()
                .map(|term| term.trim().to_string())
                .filter(|term| !term.is_empty()),
        )
        .collect()
}

fn default_file_service(services: &Value) -> Result<String, MediaError> {
    services["all_local_files"][0]["service_key"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MediaError::Response {
            endpoint: "/get_services".to_string(),
            reason: "no 'all local files' service".to_string(),
        })
}

fn verify_file_services(services: &Value, keys: &[String]) -> Result<(), MediaError> {
    for key in keys {
        let Some(service) = services["services"].get(key) else {
            return Err(MediaError::Config(format!("valid file service key (got '{}')", key)));
        };
        match service["type"].as_u64() {
            Some(FILE_DOMAIN) | Some(ALL_LOCAL_FILES) => {}
            _ => {
                return Err(MediaError::Config(format!(
                    "local file service key (got '{}')",
                    key
                )))
            }
        }
    }
    Ok(())
}

/// Depth-first search of the page tree for a files page called `name`.
fn find_page_key(page: &Value, name: &str) -> Option<String> {
    let matches_name = page["name"]
        .as_str()
        .is_some_and(|page_name| page_name.eq_ignore_ascii_case(name));
    if matches_name && page["page_type"].as_u64() == Some(FILE_PAGE_TYPE) {
        return page["page_key"].as_str().map(str::to_string);
    }
    page["pages"]
        .as_array()?
        .iter()
        .find_map(|child| find_page_key(child, name))
}
