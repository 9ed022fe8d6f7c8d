use broker_core::Store;
use tracing::{info, warn};

/// Bulk-load `username,password` lines into the accounts table at startup.
/// A missing file is not an error; malformed lines are skipped.
pub async fn load_accounts_file(store: &Store, path: &str) -> broker_core::Result<usize> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => {
            warn!(file = %path, "accounts file not found - not adding accounts");
            return Ok(0);
        }
    };

    let mut accounts = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 2 {
            warn!(line = %line, "invalid account entry");
            continue;
        }
        accounts.push((fields[0].to_string(), fields[1].to_string()));
    }

    store.upsert_accounts(&accounts).await?;
    info!(count = accounts.len(), file = %path, "loaded accounts");
    Ok(accounts.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::Store;
    use std::io::Write;

    async fn setup_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let path_str = path.to_str().unwrap().to_string();
        std::mem::forget(dir);
        Store::connect(&path_str).await.unwrap()
    }

    #[tokio::test]
    async fn test_load_accounts_skips_bad_lines() {
        let store = setup_store().await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice,pw1").unwrap();
        writeln!(file, "too,many,fields").unwrap();
        writeln!(file, "nopassword").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "carol,").unwrap();
        writeln!(file, "bob,pw2").unwrap();
        file.flush().unwrap();

        let loaded = load_accounts_file(&store, file.path().to_str().unwrap())
            .await
            .unwrap();
        // a trailing-comma line still has two fields and loads with an
        // empty password
        assert_eq!(loaded, 3);
        assert_eq!(store.account_count().await.unwrap(), 3);

        let (password,): (String,) =
            sqlx::query_as("SELECT password FROM accounts WHERE username = 'carol'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(password, "");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let store = setup_store().await;
        let loaded = load_accounts_file(&store, "does/not/exist.txt").await.unwrap();
        assert_eq!(loaded, 0);
    }
}
