//! Icecast admin interface client
//!
//! Server-wide numbers come from `/admin/stats.xml`; each mount's listener
//! list comes from `/admin/listclients?mount=...`. Both need admin
//! credentials over HTTP basic auth.

use chrono::Utc;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;

use super::{ListenerInfo, MountStats, StatsError, StatsSnapshot, StatsSource};

const AGENT: &str = concat!("stream-monitor/", env!("CARGO_PKG_VERSION"));

pub struct IcecastClient {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    preferred_mount: Option<String>,
}

impl IcecastClient {
    pub fn new(
        server: &str,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StatsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StatsError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: format!("http://{}:{}", server, port),
            user: user.into(),
            password: password.into(),
            preferred_mount: None,
        })
    }

    /// Report this mount first when the server has several
    pub fn with_preferred_mount(mut self, mount: impl Into<String>) -> Self {
        self.preferred_mount = Some(mount.into());
        self
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<String, StatsError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .basic_auth(&self.user, Some(&self.password))
            .header(USER_AGENT, AGENT)
            .send()
            .await
            .map_err(|e| StatsError::Connection(e.to_string()))?;

        match response.status() {
            StatusCode::OK => response
                .text()
                .await
                .map_err(|e| StatsError::Connection(e.to_string())),
            StatusCode::UNAUTHORIZED => Err(StatsError::Unauthorized),
            other => Err(StatsError::Status(other.as_u16())),
        }
    }

    async fn fetch_snapshot(&self) -> Result<StatsSnapshot, StatsError> {
        let body = self.get("/admin/stats.xml", &[]).await?;
        let mut snapshot = parse_stats(&body)?;

        for mount in &mut snapshot.mounts {
            let body = self
                .get("/admin/listclients", &[("mount", mount.mount.as_str())])
                .await?;
            mount.listeners = parse_listclients(&body)?;
        }

        if let Some(preferred) = &self.preferred_mount {
            if let Some(index) = snapshot.mounts.iter().position(|m| &m.mount == preferred) {
                let mount = snapshot.mounts.remove(index);
                snapshot.mounts.insert(0, mount);
            }
        }

        log::debug!(
            "Fetched stats from {}: {} mount(s)",
            self.base_url,
            snapshot.mounts.len()
        );
        Ok(snapshot)
    }
}

impl StatsSource for IcecastClient {
    fn fetch(&self) -> impl Future<Output = Result<StatsSnapshot, StatsError>> + Send {
        self.fetch_snapshot()
    }
}

fn parse_error(e: impl std::fmt::Display) -> StatsError {
    StatsError::Parse(e.to_string())
}

fn attribute(element: &BytesStart, name: &str) -> Result<Option<String>, StatsError> {
    match element.try_get_attribute(name).map_err(parse_error)? {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(parse_error)?.into_owned())),
        None => Ok(None),
    }
}

enum Node<'a> {
    Start(&'a BytesStart<'a>),
    Text(String),
}

/// Walks the document, handing each element start and text node to `visit`
/// together with the path of element names leading to it.
fn walk(
    xml: &str,
    mut visit: impl FnMut(&[String], Node<'_>) -> Result<(), StatsError>,
) -> Result<(), StatsError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event().map_err(parse_error)? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                saw_root |= path.len() == 1 && path[0] == "icestats";
                visit(&path, Node::Start(&e))?;
            }
            Event::Empty(e) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                saw_root |= path.len() == 1 && path[0] == "icestats";
                visit(&path, Node::Start(&e))?;
                path.pop();
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(parse_error)?.into_owned();
                visit(&path, Node::Text(text))?;
            }
            Event::CData(t) => {
                visit(&path, Node::Text(String::from_utf8_lossy(&t).into_owned()))?;
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(StatsError::Parse("missing <icestats> root".to_string()));
    }
    Ok(())
}

fn number(text: &str) -> Option<u32> {
    text.trim().parse().ok()
}

/// Parses `/admin/stats.xml`. Listener lists are left empty.
pub fn parse_stats(xml: &str) -> Result<StatsSnapshot, StatsError> {
    let mut listeners = None;
    let mut server_start = None;
    let mut mounts: Vec<MountStats> = Vec::new();

    walk(xml, |path, node| {
        match (path, node) {
            ([root, source], Node::Start(element)) if root == "icestats" && source == "source" => {
                mounts.push(MountStats {
                    mount: attribute(element, "mount")?.unwrap_or_default(),
                    ..MountStats::default()
                });
            }
            ([root, field], Node::Text(text)) if root == "icestats" => match field.as_str() {
                "listeners" => listeners = number(&text),
                "server_start" => server_start = Some(text),
                _ => {}
            },
            ([root, source, field], Node::Text(text)) if root == "icestats" && source == "source" => {
                if let Some(mount) = mounts.last_mut() {
                    match field.as_str() {
                        "server_description" => mount.server_description = Some(text),
                        "stream_start" => mount.stream_start = Some(text),
                        "listener_peak" => mount.listener_peak = number(&text),
                        "slow_listeners" => mount.slow_listeners = number(&text),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok(StatsSnapshot {
        listeners,
        server_start,
        mounts,
        fetched_at: Utc::now(),
    })
}

/// Parses `/admin/listclients` for a single mount
pub fn parse_listclients(xml: &str) -> Result<Vec<ListenerInfo>, StatsError> {
    let mut listeners: Vec<ListenerInfo> = Vec::new();

    walk(xml, |path, node| {
        match (path, node) {
            ([_, _, listener], Node::Start(element)) if listener == "listener" => {
                listeners.push(ListenerInfo {
                    id: attribute(element, "id")?,
                    ..ListenerInfo::default()
                });
            }
            ([_, _, listener, field], Node::Text(text)) if listener == "listener" => {
                if let Some(entry) = listeners.last_mut() {
                    match field.as_str() {
                        "IP" => entry.ip = Some(text),
                        "UserAgent" => entry.user_agent = Some(text),
                        "Connected" => entry.connected_secs = text.trim().parse().ok(),
                        // Older servers send the id as a child element
                        "ID" if entry.id.is_none() => entry.id = Some(text),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok(listeners)
}
