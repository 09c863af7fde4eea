//! 共享状态文件的读写：先写临时文件再 rename，保证其他进程看到的总是完整内容。

use crate::error::AppResult;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// 读取 JSON 状态文件；文件不存在或内容损坏时返回默认值（损坏时记录告警）。
pub async fn read_json_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let data = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "读取状态文件失败，按空状态处理");
            return T::default();
        }
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return T::default();
    }
    match sonic_rs::from_slice(&data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "状态文件内容损坏，按空状态处理");
            T::default()
        }
    }
}

/// 序列化后原子替换目标文件。
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let data = sonic_rs::to_vec_pretty(value)?;
    write_atomic(path, &data).await
}

pub async fn write_atomic(path: &Path, data: &[u8]) -> AppResult<()> {
    ensure_parent_dir(path).await?;
    let tmp = temp_path(path);
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

pub async fn ensure_parent_dir(path: &Path) -> AppResult<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// 同目录下的临时文件名（同一文件系统内 rename 才是原子的）。
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(".{name}.{}.{}.tmp", std::process::id(), &suffix[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn missing_and_corrupt_files_read_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let v: BTreeMap<String, i64> = read_json_or_default(&path).await;
        assert!(v.is_empty());

        tokio::fs::write(&path, b"{not json").await.unwrap();
        let v: BTreeMap<String, i64> = read_json_or_default(&path).await;
        assert!(v.is_empty());
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut v = BTreeMap::new();
        v.insert("a".to_string(), 1i64);
        write_json_atomic(&path, &v).await.unwrap();
        v.insert("b".to_string(), 2);
        write_json_atomic(&path, &v).await.unwrap();

        let back: BTreeMap<String, i64> = read_json_or_default(&path).await;
        assert_eq!(back, v);

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["state.json".to_string()]);
    }
}
