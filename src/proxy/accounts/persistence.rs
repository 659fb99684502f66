use crate::error::{ProxyError, ProxyResult};
use crate::models::Account;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub fn accounts_file(data_dir: &Path) -> PathBuf {
    data_dir.join("accounts.json")
}

// Atomic replace: write a temp file in the same directory, then rename over
// the target. A crash mid-write leaves the previous file intact.
pub fn save_accounts(data_dir: &Path, accounts: &HashMap<String, Account>) -> ProxyResult<()> {
    std::fs::create_dir_all(data_dir)?;
    let target = accounts_file(data_dir);
    let tmp = data_dir.join(format!(
        "accounts.json.{}.tmp",
        uuid::Uuid::new_v4().simple()
    ));

    let body = serde_json::to_vec_pretty(accounts)
        .map_err(|e| ProxyError::Internal(format!("serialize accounts: {}", e)))?;

    if let Err(e) = std::fs::write(&tmp, &body) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&tmp, &target) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }

    tracing::debug!(
        "[Registry] Saved {} accounts to {}",
        accounts.len(),
        target.display()
    );
    Ok(())
}

pub fn load_accounts(data_dir: &Path) -> ProxyResult<HashMap<String, Account>> {
    let path = accounts_file(data_dir);
    if !path.exists() {
        tracing::info!("[Registry] No accounts file at {}", path.display());
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(&path)?;
    let accounts: HashMap<String, Account> = serde_json::from_str(&raw)
        .map_err(|e| ProxyError::Internal(format!("parse {}: {}", path.display(), e)))?;
    tracing::info!(
        "[Registry] Loaded {} accounts from {}",
        accounts.len(),
        path.display()
    );
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Account;

    fn sample(id: &str) -> Account {
        Account::new(id.to_string(), Some("sessionKey=k".into()), None, vec![])
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = HashMap::new();
        map.insert("org-1".to_string(), sample("org-1"));
        map.insert("org-2".to_string(), sample("org-2"));

        save_accounts(dir.path(), &map).unwrap();
        let loaded = load_accounts(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains_key("org-1"));
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = HashMap::new();
        map.insert("org-1".to_string(), sample("org-1"));
        save_accounts(dir.path(), &map).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    // A stray temp file from a crashed writer must not shadow the real
    // file: the target keeps its pre-write content until the rename.
    #[test]
    fn interrupted_write_preserves_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = HashMap::new();
        map.insert("org-1".to_string(), sample("org-1"));
        save_accounts(dir.path(), &map).unwrap();

        // Simulate a crash between temp write and rename.
        std::fs::write(dir.path().join("accounts.json.deadbeef.tmp"), b"{garbage").unwrap();

        let loaded = load_accounts(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("org-1"));
    }

    #[test]
    fn missing_file_is_empty_fleet() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_accounts(dir.path()).unwrap().is_empty());
    }
}
