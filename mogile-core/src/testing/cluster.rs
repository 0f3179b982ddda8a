//! A whole tracker plus storage cluster in memory.
//!
//! Speaks the real line protocol over duplex pipes and keeps its object
//! bytes in a [`MemoryHttp`], so every layer of the client is exercised.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use super::http::MemoryHttp;
use crate::client::MogileClient;
use crate::config::{HostEndpoint, MogileConfig};
use crate::tracker::wire::{decode_query, encode_query};
use crate::tracker::{ObjectDirectory, TrackerConnection, TrackerConnector, TrackerResponse};
use crate::transfer::ObjectTransfer;

/// Storage nodes a committed object is mirrored to.
const STORAGE_NODES: u32 = 3;

struct PendingWrite {
    key: String,
    path: String,
}

struct ClusterState {
    domains: BTreeMap<String, BTreeMap<String, u64>>,
    files: BTreeMap<String, Vec<String>>,
    pending: HashMap<String, PendingWrite>,
    next_fid: u64,
    visible_replicas: usize,
    replication_delay: u32,
    duplicate_paths: bool,
    path_polls: HashMap<String, u32>,
    unreachable: bool,
    requests: Vec<String>,
}

impl Default for ClusterState {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        classes.insert("default".to_string(), 2);
        let mut domains = BTreeMap::new();
        domains.insert("testdomain".to_string(), classes);

        Self {
            domains,
            files: BTreeMap::new(),
            pending: HashMap::new(),
            next_fid: 1,
            visible_replicas: STORAGE_NODES as usize,
            replication_delay: 0,
            duplicate_paths: false,
            path_polls: HashMap::new(),
            unreachable: false,
            requests: Vec::new(),
        }
    }
}

/// Fake MogileFS cluster: one tracker and [`STORAGE_NODES`] storage nodes.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
    http: MemoryHttp,
}

impl FakeCluster {
    /// Storage side of the cluster.
    pub fn http(&self) -> &MemoryHttp {
        &self.http
    }

    /// Caps how many replicas `GET_PATHS` reports per key.
    pub fn set_visible_replicas(&self, count: usize) {
        self.state.lock().visible_replicas = count;
    }

    /// Reports a single replica for the first `polls` lookups of each key.
    pub fn set_replication_delay(&self, polls: u32) {
        self.state.lock().replication_delay = polls;
    }

    /// Reports the first replica of a key once per visible replica.
    pub fn set_duplicate_paths(&self, duplicate: bool) {
        self.state.lock().duplicate_paths = duplicate;
    }

    /// Makes every new tracker connection fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn add_class(&self, domain: &str, class: &str, min_devices: u64) {
        self.state
            .lock()
            .domains
            .entry(domain.to_string())
            .or_default()
            .insert(class.to_string(), min_devices);
    }

    /// Committed keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }

    /// Every replica URL of `key`, regardless of visibility settings.
    pub fn replicas(&self, key: &str) -> Vec<String> {
        self.state.lock().files.get(key).cloned().unwrap_or_default()
    }

    /// Commits `data` under `key` without going through the client.
    pub fn seed(&self, key: &str, data: &[u8]) {
        let fid = self.allocate_fid();
        let paths: Vec<String> = (1..=STORAGE_NODES).map(|node| replica_url(node, fid)).collect();
        for path in &paths {
            self.http.insert(path, data);
        }
        self.state.lock().files.insert(key.to_string(), paths);
    }

    /// Request lines received so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    /// Connector dialing this cluster's tracker.
    pub fn connector(&self) -> ClusterConnector {
        ClusterConnector {
            cluster: self.clone(),
        }
    }

    /// Directory talking to this cluster.
    pub fn directory(&self, config: &MogileConfig) -> ObjectDirectory<ClusterConnector> {
        ObjectDirectory::new(TrackerConnection::with_connector(
            &config.tracker,
            self.connector(),
        ))
    }

    /// Full client talking to this cluster.
    pub fn client(&self, config: &MogileConfig) -> MogileClient<ClusterConnector, MemoryHttp> {
        MogileClient::from_parts(
            self.directory(config),
            ObjectTransfer::new(self.http.clone()),
        )
    }

    fn allocate_fid(&self) -> u64 {
        let mut state = self.state.lock();
        let fid = state.next_fid;
        state.next_fid += 1;
        fid
    }

    /// Answers one request line with one reply line.
    pub fn handle_line(&self, line: &str) -> String {
        let line = line.trim_end_matches(['\r', '\n']);
        self.state.lock().requests.push(line.to_string());

        let (command, blob) = line.split_once(' ').unwrap_or((line, ""));
        let args = match decode_query(blob) {
            Ok(args) => args,
            Err(_) => return err_line("bad_params", "bad_params"),
        };

        let result = match command {
            "GET_DOMAINS" => Ok(self.get_domains()),
            "GET_PATHS" => self.get_paths(&args),
            "DELETE" => self.delete(&args),
            "RENAME" => self.rename(&args),
            "LIST_KEYS" => self.list_keys(&args),
            "CREATE_OPEN" => self.create_open(&args),
            "CREATE_CLOSE" => self.create_close(&args),
            _ => Err(("unknown_command", "unknown_command")),
        };

        match result {
            Ok(pairs) => {
                let query = encode_query(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                format!("OK {query}\r\n")
            }
            Err((code, message)) => err_line(code, message),
        }
    }

    fn get_domains(&self) -> Vec<(String, String)> {
        let state = self.state.lock();
        let mut pairs = vec![("domains".to_string(), state.domains.len().to_string())];
        for (i, (domain, classes)) in state.domains.iter().enumerate() {
            let prefix = format!("domain{}", i + 1);
            pairs.push((prefix.clone(), domain.clone()));
            pairs.push((format!("{prefix}classes"), classes.len().to_string()));
            for (j, (class, min_devices)) in classes.iter().enumerate() {
                let class_prefix = format!("{prefix}class{}", j + 1);
                pairs.push((format!("{class_prefix}name"), class.clone()));
                pairs.push((format!("{class_prefix}mindevcount"), min_devices.to_string()));
            }
        }
        pairs
    }

    fn get_paths(&self, args: &TrackerResponse) -> Reply {
        let key = required(args, "key")?;
        let mut state = self.state.lock();

        let polls = state.path_polls.entry(key.to_string()).or_default();
        *polls += 1;
        let polls = *polls;

        let visible = if polls <= state.replication_delay {
            1
        } else {
            state.visible_replicas
        };
        let paths: Vec<String> = match state.files.get(key) {
            Some(paths) if state.duplicate_paths => paths
                .first()
                .map(|first| vec![first.clone(); visible.min(paths.len())])
                .unwrap_or_default(),
            Some(paths) => paths.iter().take(visible).cloned().collect(),
            None => Vec::new(),
        };

        let mut pairs = vec![("paths".to_string(), paths.len().to_string())];
        for (i, path) in paths.into_iter().enumerate() {
            pairs.push((format!("path{}", i + 1), path));
        }
        Ok(pairs)
    }

    fn delete(&self, args: &TrackerResponse) -> Reply {
        let key = required(args, "key")?;
        let removed = self.state.lock().files.remove(key);
        match removed {
            Some(paths) => {
                for path in paths {
                    self.http.remove(&path);
                }
                Ok(Vec::new())
            }
            None => Err(("unknown_key", "unknown_key")),
        }
    }

    fn rename(&self, args: &TrackerResponse) -> Reply {
        let from = required(args, "from_key")?;
        let to = required(args, "to_key")?;
        let mut state = self.state.lock();

        if state.files.contains_key(to) {
            return Err(("key_exists", "key_exists"));
        }
        let paths = state.files.remove(from).ok_or(("unknown_key", "unknown_key"))?;
        state.files.insert(to.to_string(), paths);
        Ok(Vec::new())
    }

    fn list_keys(&self, args: &TrackerResponse) -> Reply {
        let prefix = args.get("prefix").unwrap_or_default();
        let after = args.get("after").unwrap_or_default();
        let limit: usize = args
            .get("limit")
            .and_then(|limit| limit.parse().ok())
            .unwrap_or(1000);

        let state = self.state.lock();
        let keys: Vec<&String> = state
            .files
            .keys()
            .filter(|key| key.starts_with(prefix) && key.as_str() > after)
            .take(limit)
            .collect();

        let next_after = keys.last().map(|key| key.to_string()).unwrap_or_default();
        let mut pairs = vec![
            ("key_count".to_string(), keys.len().to_string()),
            ("next_after".to_string(), next_after),
        ];
        for (i, key) in keys.into_iter().enumerate() {
            pairs.push((format!("key_{}", i + 1), key.clone()));
        }
        Ok(pairs)
    }

    fn create_open(&self, args: &TrackerResponse) -> Reply {
        let key = required(args, "key")?;
        let fid = self.allocate_fid();
        let path = replica_url(1, fid);

        self.state.lock().pending.insert(
            fid.to_string(),
            PendingWrite {
                key: key.to_string(),
                path: path.clone(),
            },
        );

        Ok(vec![
            ("devid".to_string(), "1".to_string()),
            ("fid".to_string(), fid.to_string()),
            ("path".to_string(), path),
        ])
    }

    fn create_close(&self, args: &TrackerResponse) -> Reply {
        let key = required(args, "key")?;
        let fid = required(args, "fid")?;
        let path = required(args, "path")?;

        let pending = self
            .state
            .lock()
            .pending
            .remove(fid)
            .ok_or(("no_temp_file", "no_temp_file"))?;
        if pending.key != key || pending.path != path {
            return Err(("bad_params", "bad_params"));
        }
        if self.http.object(path).is_none() {
            return Err(("empty_file", "empty_file"));
        }

        let fid: u64 = fid.parse().map_err(|_| ("bad_params", "bad_params"))?;
        let mut paths = vec![path.to_string()];
        for node in 2..=STORAGE_NODES {
            let mirror = replica_url(node, fid);
            self.http.copy_object(path, &mirror);
            paths.push(mirror);
        }

        let mut state = self.state.lock();
        state.path_polls.remove(key);
        state.files.insert(key.to_string(), paths);
        Ok(Vec::new())
    }

    fn serve(&self) -> io::Result<DuplexStream> {
        if self.state.lock().unreachable {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let cluster = self.clone();
        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            loop {
                line.clear();
                match server.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let reply = cluster.handle_line(&line);
                if server.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        Ok(client)
    }
}

type Reply = Result<Vec<(String, String)>, (&'static str, &'static str)>;

fn required<'a>(args: &'a TrackerResponse, key: &str) -> Result<&'a str, (&'static str, &'static str)> {
    args.get(key)
        .filter(|value| !value.is_empty())
        .ok_or(("bad_params", "bad_params"))
}

fn replica_url(node: u32, fid: u64) -> String {
    format!("http://storage{node}.test:7500/dev{node}/0/000/000/{fid:010}.fid")
}

fn err_line(code: &str, message: &str) -> String {
    format!("ERR {code} {message}\r\n")
}

/// [`TrackerConnector`] that dials a [`FakeCluster`].
#[derive(Clone)]
pub struct ClusterConnector {
    cluster: FakeCluster,
}

#[async_trait]
impl TrackerConnector for ClusterConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _endpoint: &HostEndpoint) -> io::Result<DuplexStream> {
        self.cluster.serve()
    }
}
