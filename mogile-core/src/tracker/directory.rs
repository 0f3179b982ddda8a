//! Logical tracker operations on top of a raw connection
//!
//! Each method owns the reply-shape contract of one tracker command and
//! turns shape violations into `MogileError::Protocol`.

use std::collections::BTreeMap;

use serde::Serialize;

use super::connection::{TcpConnector, TrackerConnection, TrackerConnector};
use super::wire::TrackerCommand;
use crate::MogileError;

/// Classes of every domain, mapped to their minimum device count.
pub type DomainClasses = BTreeMap<String, BTreeMap<String, u64>>;

/// Write target handed out by `CREATE_OPEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOpenTicket {
    /// Storage node URL to PUT the bytes to
    pub path: String,
    pub devid: String,
    pub fid: String,
}

/// One page of a `LIST_KEYS` enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListKeysPage {
    /// Cursor for the following page, absent once the tracker has none
    pub next_after: Option<String>,
    pub keys: Vec<String>,
}

/// Directory view of a tracker: lookups, creates, renames, deletes.
pub struct ObjectDirectory<C: TrackerConnector = TcpConnector> {
    connection: TrackerConnection<C>,
}

impl<C: TrackerConnector> ObjectDirectory<C> {
    pub fn new(connection: TrackerConnection<C>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &TrackerConnection<C> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut TrackerConnection<C> {
        &mut self.connection
    }

    /// Closes the current connection and connects again.
    ///
    /// # Errors
    ///
    /// - `MogileError::ConnectionFailed` - If no tracker is reachable
    pub async fn reconnect(&mut self) -> Result<(), MogileError> {
        self.connection.close().await;
        self.connection.connect().await
    }

    pub async fn close(&mut self) {
        self.connection.close().await;
    }

    /// Lists every domain and its classes.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If any indexed domain or class field is
    ///   missing or not numeric where a count is expected
    pub async fn list_domains(&mut self) -> Result<DomainClasses, MogileError> {
        let response = self.connection.send(TrackerCommand::GetDomains, &[]).await?;

        let mut domains = BTreeMap::new();
        for i in 1..=response.require_u64("domains")? {
            let prefix = format!("domain{i}");
            let name = response.require(&prefix)?.to_string();

            let mut classes = BTreeMap::new();
            for j in 1..=response.require_u64(&format!("{prefix}classes"))? {
                let class_prefix = format!("{prefix}class{j}");
                let class_name = response.require(&format!("{class_prefix}name"))?;
                let min_devices = response.require_u64(&format!("{class_prefix}mindevcount"))?;
                classes.insert(class_name.to_string(), min_devices);
            }

            domains.insert(name, classes);
        }

        Ok(domains)
    }

    /// Returns the replica URLs of `key` in tracker order.
    ///
    /// An empty list is a valid answer for an object without known replicas.
    ///
    /// # Errors
    ///
    /// - `MogileError::Remote` - If the tracker refused the lookup
    pub async fn get_paths(&mut self, key: &str) -> Result<Vec<String>, MogileError> {
        let response = self
            .connection
            .send(TrackerCommand::GetPaths, &[("key", key)])
            .await?;

        Ok(response
            .into_pairs()
            .into_iter()
            .filter(|(field, _)| field != "paths")
            .map(|(_, path)| path)
            .collect())
    }

    /// Deletes `key`.
    ///
    /// # Errors
    ///
    /// - `MogileError::Remote` - If the tracker refused, e.g. unknown key
    pub async fn delete(&mut self, key: &str) -> Result<(), MogileError> {
        self.connection
            .send(TrackerCommand::Delete, &[("key", key)])
            .await?;
        Ok(())
    }

    /// Renames `from` to `to`.
    ///
    /// # Errors
    ///
    /// - `MogileError::Remote` - If the tracker refused the rename
    pub async fn rename(&mut self, from: &str, to: &str) -> Result<(), MogileError> {
        self.connection
            .send(TrackerCommand::Rename, &[("from_key", from), ("to_key", to)])
            .await?;
        Ok(())
    }

    /// Asks the tracker where to write a new object.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If the returned path is not an absolute
    ///   URL or `devid`/`fid` are missing
    pub async fn create_open(
        &mut self,
        key: &str,
        class: &str,
    ) -> Result<CreateOpenTicket, MogileError> {
        let response = self
            .connection
            .send(TrackerCommand::CreateOpen, &[("key", key), ("class", class)])
            .await?;

        let path = response.require("path")?;
        url::Url::parse(path).map_err(|e| {
            MogileError::protocol(format!("unrecognized path '{path}' from tracker: {e}"))
        })?;

        Ok(CreateOpenTicket {
            path: path.to_string(),
            devid: response.require("devid")?.to_string(),
            fid: response.require("fid")?.to_string(),
        })
    }

    /// Commits an upload made against `ticket`.
    ///
    /// The path is sent in decoded form, which is what the tracker stores.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If the path cannot be percent-decoded
    /// - `MogileError::Remote` - If the tracker refused the commit
    pub async fn create_close(
        &mut self,
        key: &str,
        class: &str,
        ticket: &CreateOpenTicket,
    ) -> Result<(), MogileError> {
        let path = urlencoding::decode(&ticket.path).map_err(|_| {
            MogileError::protocol(format!("path '{}' is not valid UTF-8", ticket.path))
        })?;

        self.connection
            .send(
                TrackerCommand::CreateClose,
                &[
                    ("key", key),
                    ("class", class),
                    ("devid", &ticket.devid),
                    ("fid", &ticket.fid),
                    ("path", &path),
                ],
            )
            .await?;
        Ok(())
    }

    /// Lists up to `limit` keys starting with `prefix`, after `after`.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If `key_count`, `next_after` or any
    ///   announced `key_<n>` is absent
    pub async fn list_keys(
        &mut self,
        prefix: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<ListKeysPage, MogileError> {
        let limit = limit.to_string();
        let mut args = vec![("prefix", prefix), ("limit", limit.as_str())];
        if let Some(after) = after.filter(|after| !after.is_empty()) {
            args.push(("after", after));
        }

        let response = self.connection.send(TrackerCommand::ListKeys, &args).await?;

        let key_count = response.require_u64("key_count")?;
        let next_after = response.require("next_after")?;

        let keys = (1..=key_count)
            .map(|n| response.require(&format!("key_{n}")).map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListKeysPage {
            next_after: (!next_after.is_empty()).then(|| next_after.to_string()),
            keys,
        })
    }

    /// Walks every page of `LIST_KEYS` for `prefix`.
    ///
    /// Stops at the first page shorter than `limit`.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If `limit` is zero
    /// - Any error of [`ObjectDirectory::list_keys`]
    pub async fn list_all_keys(
        &mut self,
        prefix: &str,
        limit: u32,
    ) -> Result<Vec<String>, MogileError> {
        if limit == 0 {
            return Err(MogileError::configuration("list limit must be positive"));
        }

        let mut all_keys = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let page = self.list_keys(prefix, after.as_deref(), limit).await?;
            let page_len = page.keys.len();
            all_keys.extend(page.keys);

            match page.next_after {
                Some(next) if page_len as u64 >= u64::from(limit) => after = Some(next),
                _ => break,
            }
        }

        tracing::debug!("Listed {} keys with prefix '{}'", all_keys.len(), prefix);
        Ok(all_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scripted_directory;

    #[tokio::test]
    async fn test_list_domains() {
        let mut directory = scripted_directory(
            Some("media"),
            vec![(
                "GET_DOMAINS domain=media\n",
                "OK domains=1&domain1=media&domain1classes=2\
                 &domain1class1name=default&domain1class1mindevcount=2\
                 &domain1class2name=thumbs&domain1class2mindevcount=1\r\n",
            )],
        );

        let domains = directory.list_domains().await.unwrap();

        assert_eq!(domains.len(), 1);
        assert_eq!(domains["media"]["default"], 2);
        assert_eq!(domains["media"]["thumbs"], 1);
    }

    #[tokio::test]
    async fn test_list_domains_missing_class_field() {
        let mut directory = scripted_directory(
            None,
            vec![(
                "GET_DOMAINS\n",
                "OK domains=1&domain1=media&domain1classes=1&domain1class1name=default\r\n",
            )],
        );

        let result = directory.list_domains().await;

        assert!(matches!(
            result,
            Err(MogileError::Protocol { message }) if message.contains("domain1class1mindevcount")
        ));
    }

    #[tokio::test]
    async fn test_get_paths_preserves_order() {
        let mut directory = scripted_directory(
            None,
            vec![(
                "GET_PATHS key=doc1\n",
                "OK path1=http://a/1.fid&path2=http://b/1.fid&paths=2\r\n",
            )],
        );

        let paths = directory.get_paths("doc1").await.unwrap();

        assert_eq!(paths, vec!["http://a/1.fid", "http://b/1.fid"]);
    }

    #[tokio::test]
    async fn test_get_paths_missing_object_is_empty() {
        let mut directory =
            scripted_directory(None, vec![("GET_PATHS key=missing\n", "OK paths=0\r\n")]);

        assert!(directory.get_paths("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_key_is_remote_error() {
        let mut directory = scripted_directory(
            None,
            vec![("DELETE key=ghost\n", "ERR unknown_key unknown_key\r\n")],
        );

        let result = directory.delete("ghost").await;

        assert!(matches!(
            result,
            Err(MogileError::Remote { message }) if message == "ERR unknown_key unknown_key"
        ));
    }

    #[tokio::test]
    async fn test_rename() {
        let mut directory = scripted_directory(
            None,
            vec![("RENAME from_key=old&to_key=new\n", "OK \r\n")],
        );

        directory.rename("old", "new").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_open_and_close() {
        let mut directory = scripted_directory(
            Some("d"),
            vec![
                (
                    "CREATE_OPEN domain=d&key=k&class=default\n",
                    "OK devid=3&fid=42&path=http%3A%2F%2F10.0.0.3%3A7500%2Fdev3%2F0%2F000%2F000%2F0000000042.fid\r\n",
                ),
                (
                    "CREATE_CLOSE domain=d&key=k&class=default&devid=3&fid=42\
                     &path=http%3A%2F%2F10.0.0.3%3A7500%2Fdev3%2Fmy%2Bfile.fid\n",
                    "OK \r\n",
                ),
            ],
        );

        let ticket = directory.create_open("k", "default").await.unwrap();
        assert_eq!(
            ticket.path,
            "http://10.0.0.3:7500/dev3/0/000/000/0000000042.fid"
        );
        assert_eq!(ticket.devid, "3");
        assert_eq!(ticket.fid, "42");

        // Transport-level encoding in the path is undone before committing
        let encoded = CreateOpenTicket {
            path: "http://10.0.0.3:7500/dev3/my%2Bfile.fid".to_string(),
            ..ticket
        };
        directory.create_close("k", "default", &encoded).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_open_rejects_relative_path() {
        let mut directory = scripted_directory(
            None,
            vec![(
                "CREATE_OPEN key=k&class=default\n",
                "OK devid=1&fid=2&path=dev1%2F0000000002.fid\r\n",
            )],
        );

        let result = directory.create_open("k", "default").await;

        assert!(matches!(result, Err(MogileError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_list_keys_page() {
        let mut directory = scripted_directory(
            None,
            vec![(
                "LIST_KEYS prefix=img&limit=2&after=img0\n",
                "OK key_count=2&next_after=img2&key_1=img1&key_2=img2\r\n",
            )],
        );

        let page = directory.list_keys("img", Some("img0"), 2).await.unwrap();

        assert_eq!(page.keys, vec!["img1", "img2"]);
        assert_eq!(page.next_after.as_deref(), Some("img2"));
    }

    #[tokio::test]
    async fn test_list_keys_requires_control_fields() {
        let mut directory = scripted_directory(
            None,
            vec![
                ("LIST_KEYS prefix=a&limit=10\n", "OK key_count=0\r\n"),
                ("LIST_KEYS prefix=a&limit=10\n", "OK next_after=&key_1=a\r\n"),
                (
                    "LIST_KEYS prefix=a&limit=10\n",
                    "OK key_count=2&next_after=a&key_1=a\r\n",
                ),
            ],
        );

        for _ in 0..3 {
            let result = directory.list_keys("a", None, 10).await;
            assert!(matches!(result, Err(MogileError::Protocol { .. })));
        }
    }

    #[tokio::test]
    async fn test_list_all_keys_follows_cursor() {
        let mut directory = scripted_directory(
            None,
            vec![
                (
                    "LIST_KEYS prefix=k&limit=2\n",
                    "OK key_count=2&next_after=k2&key_1=k1&key_2=k2\r\n",
                ),
                (
                    "LIST_KEYS prefix=k&limit=2&after=k2\n",
                    "OK key_count=2&next_after=k4&key_1=k3&key_2=k4\r\n",
                ),
                (
                    "LIST_KEYS prefix=k&limit=2&after=k4\n",
                    "OK key_count=1&next_after=k5&key_1=k5\r\n",
                ),
            ],
        );

        let keys = directory.list_all_keys("k", 2).await.unwrap();

        assert_eq!(keys, vec!["k1", "k2", "k3", "k4", "k5"]);
    }
}
