use std::collections::HashMap;
use std::sync::Mutex;

/// Source of truth for the {canary hostname -> credential id} mapping.
///
/// Updated whenever credentials are created or deleted; queried by the DNS
/// canary monitor on every observed query. Lookups are case-insensitive
/// and tolerate the trailing dot DNS packets carry.
pub struct CanaryManager {
    hostnames: Mutex<HashMap<String, Option<i64>>>,
}

impl CanaryManager {
    pub fn new<I: IntoIterator<Item = String>>(hostnames: I) -> Self {
        Self {
            hostnames: Mutex::new(
                hostnames
                    .into_iter()
                    .map(|h| (normalize(&h), None))
                    .collect(),
            ),
        }
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    pub fn add_hostname(&self, hostname: &str) {
        self.hostnames
            .lock()
            .unwrap()
            .entry(normalize(hostname))
            .or_insert(None);
    }

    pub fn register_credential(&self, hostname: &str, credential_id: i64) {
        self.hostnames
            .lock()
            .unwrap()
            .insert(normalize(hostname), Some(credential_id));
    }

    pub fn remove_hostname(&self, hostname: &str) {
        self.hostnames.lock().unwrap().remove(&normalize(hostname));
    }

    /// True if a DNS query name matches a known canary hostname exactly.
    pub fn check_query(&self, query_name: &str) -> bool {
        self.hostnames
            .lock()
            .unwrap()
            .contains_key(&normalize(query_name))
    }

    pub fn get_credential_id(&self, hostname: &str) -> Option<i64> {
        self.hostnames
            .lock()
            .unwrap()
            .get(&normalize(hostname))
            .copied()
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.hostnames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hostnames.lock().unwrap().is_empty()
    }
}

fn normalize(hostname: &str) -> String {
    hostname.trim().trim_end_matches('.').to_lowercase()
}
