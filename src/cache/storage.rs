//! SQLite implementation of the named response caches.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::traits::{CacheStorage, Request, Response};
use crate::db::Database;

/// Cache storage backed by the shared state database.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, name: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, datetime('now'))",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, cache: &str, request: &Request, response: &Response) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Putting into a cache implicitly opens it
    tx.execute(
      "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, datetime('now'))",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, method, url, status, content_type, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache,
        request.cache_key(),
        request.method,
        request.url.as_str(),
        response.status,
        response.content_type,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store response for {}: {}", request.url, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn lookup(&self, cache: &str, request: &Request) -> Result<Option<Response>> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        "SELECT status, content_type, body FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![cache, request.cache_key()],
        |row| {
          Ok(Response {
            status: row.get(0)?,
            content_type: row.get(1)?,
            body: row.get(2)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in cache {}: {}", request.url, cache, e))
  }

  fn urls(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    Ok(urls)
  }
}
