//! URL and IP-path discovery in attacker input
//!
//! Every finalized line (and every exec payload) is scanned for things that
//! look like payload locations. Matches go to the download queue; nothing is
//! fetched from here.

use chrono::Utc;
use regex::Regex;
use std::net::IpAddr;
use std::ops::Range;
use std::sync::Arc;
use tracing::{error, info};

use crate::db::{DownloadQueue, QueueEntry, ResourceKind};

/// Liberal "URL in free text" matcher: scheme-prefixed, `www.`-prefixed and
/// bare `domain.tld/...` forms, with balanced parentheses allowed inside.
const URL_PATTERN: &str = r#"(?i)\b((?:https?://|www\d{0,3}[.]|[a-z0-9.\-]+[.][a-z]{2,4}/)(?:[^\s()<>]+|\(([^\s()<>]+|(\([^\s()<>]+\)))*\))+(?:\(([^\s()<>]+|(\([^\s()<>]+\)))*\)|[^\s`!()\[\]{};:'".,<>?«»“”‘’]))"#;

/// Dotted IPv4 followed by a path.
const IP_PATTERN: &str = r"[0-9]+(?:\.[0-9]+){3}/\S*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub text: String,
}

/// Compiled resource patterns
#[derive(Debug, Clone)]
pub struct ResourceMatcher {
    url: Regex,
    ip: Regex,
}

impl ResourceMatcher {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            url: Regex::new(URL_PATTERN)?,
            ip: Regex::new(IP_PATTERN)?,
        })
    }

    /// All resources in `line`, in order of appearance.
    pub fn find(&self, line: &str) -> Vec<Resource> {
        let mut found: Vec<(Range<usize>, Resource)> = self
            .url
            .find_iter(line)
            .map(|m| {
                (
                    m.range(),
                    Resource {
                        kind: ResourceKind::Url,
                        text: m.as_str().to_string(),
                    },
                )
            })
            .collect();

        let url_spans: Vec<Range<usize>> = found.iter().map(|(span, _)| span.clone()).collect();
        for m in self.ip.find_iter(line) {
            let inside_url = url_spans
                .iter()
                .any(|span| m.start() < span.end && span.start < m.end());
            if !inside_url {
                found.push((
                    m.range(),
                    Resource {
                        kind: ResourceKind::IpPath,
                        text: m.as_str().to_string(),
                    },
                ));
            }
        }

        found.sort_by_key(|(span, _)| span.start);
        found.into_iter().map(|(_, resource)| resource).collect()
    }
}

/// Feeds discovered resources to the download queue.
pub struct Extractor {
    matcher: ResourceMatcher,
    queue: Arc<dyn DownloadQueue>,
}

impl Extractor {
    pub fn new(queue: Arc<dyn DownloadQueue>) -> Result<Self, regex::Error> {
        Ok(Self {
            matcher: ResourceMatcher::new()?,
            queue,
        })
    }

    /// Queue every resource in `text`. Returns how many were found.
    pub fn scan(&self, text: &str, peer: IpAddr, session_id: &str) -> usize {
        let resources = self.matcher.find(text);
        for resource in &resources {
            match resource.kind {
                ResourceKind::Url => info!(peer = %peer, url = %resource.text, "Found URL"),
                ResourceKind::IpPath => info!(peer = %peer, ip = %resource.text, "Found IP"),
            }

            let entry = QueueEntry {
                resource: resource.text.clone(),
                kind: resource.kind,
                source_ip: peer.to_string(),
                session_id: session_id.to_string(),
                discovered_at: Utc::now(),
            };
            if let Err(e) = self.queue.push(entry) {
                error!(error = %e, resource = %resource.text, "Failed to queue resource");
            }
        }
        resources.len()
    }
}
