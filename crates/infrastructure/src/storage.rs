//! JSON 文件持久化
//!
//! 写入先落到同目录的临时文件，再通过 rename 原子替换，进程崩溃不会留下半截文件。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fleet_core::{BundleStore, ConfigBundle, FleetError, FleetResult, Node, NodeRegistryStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

const NODES_FILE: &str = "nodes.json";
const BUNDLE_FILE: &str = "bundle.json";

/// 原子写入 JSON 文件
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> FleetResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let data = serde_json::to_vec_pretty(value)?;
    let tmp_path = temp_path(path);
    tokio::fs::write(&tmp_path, &data).await?;
    tokio::fs::rename(&tmp_path, path).await.map_err(|e| {
        FleetError::storage(format!("替换文件 {} 失败: {}", path.display(), e))
    })?;

    debug!("已写入 {} ({} 字节)", path.display(), data.len());
    Ok(())
}

/// 读取 JSON 文件，文件不存在时返回 None
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> FleetResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FleetError::storage(format!(
            "读取文件 {} 失败: {}",
            path.display(),
            e
        ))),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// 节点注册表存储
pub struct JsonNodeRegistryStore {
    path: PathBuf,
}

impl JsonNodeRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 在数据目录下使用默认文件名
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(NODES_FILE))
    }
}

#[async_trait]
impl NodeRegistryStore for JsonNodeRegistryStore {
    async fn load_nodes(&self) -> FleetResult<Vec<Node>> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn save_nodes(&self, nodes: &[Node]) -> FleetResult<()> {
        write_json_atomic(&self.path, nodes).await
    }
}

/// 当前配置包存储
pub struct JsonBundleStore {
    path: PathBuf,
}

impl JsonBundleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(BUNDLE_FILE))
    }
}

#[async_trait]
impl BundleStore for JsonBundleStore {
    async fn load_bundle(&self) -> FleetResult<Option<ConfigBundle>> {
        read_json(&self.path).await
    }

    async fn save_bundle(&self, bundle: &ConfigBundle) -> FleetResult<()> {
        write_json_atomic(&self.path, bundle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path(Path::new("/var/lib/fleet/bundle.json"));
        assert_eq!(tmp, PathBuf::from("/var/lib/fleet/bundle.json.tmp"));
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<serde_json::Value> = read_json(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BUNDLE_FILE);
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = JsonBundleStore::new(&path);
        assert!(matches!(
            store.load_bundle().await,
            Err(FleetError::Serialization(_))
        ));
    }
}
