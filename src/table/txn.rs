//! Transactional replacement of parts.
//!
//! A merge never touches live part directories directly. It writes its
//! output under `tmp/`, then records a transaction in `txn/`:
//!
//! ```text
//! <part to remove>
//! <part to remove>
//! tmp/<new part> -> <new part>
//! ```
//!
//! Paths are relative to the table directory. Applying a transaction is
//! idempotent, so transactions left behind by a crash are replayed on open in
//! file name order.

use crate::error::{Error, Result};
use crate::fs;
use crate::table::tasks::TaskGroup;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Directory holding pending transactions.
pub const TXN_DIRNAME: &str = "txn";

const RENAME_SEPARATOR: &str = " -> ";

/// A set of part removals plus an optional rename of the merge output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Transaction {
    pub remove: Vec<PathBuf>,
    pub rename: Option<(PathBuf, PathBuf)>,
}

impl Transaction {
    fn marshal(&self) -> String {
        let mut s = String::new();
        for path in &self.remove {
            s.push_str(&path.to_string_lossy());
            s.push('\n');
        }
        if let Some((src, dst)) = &self.rename {
            s.push_str(&src.to_string_lossy());
            s.push_str(RENAME_SEPARATOR);
            s.push_str(&dst.to_string_lossy());
            s.push('\n');
        }
        s
    }

    fn parse(data: &str) -> Result<Self> {
        let mut txn = Transaction::default();
        for line in data.lines().filter(|l| !l.is_empty()) {
            if txn.rename.is_some() {
                return Err(Error::corruption(format!(
                    "unexpected line {:?} after the rename line",
                    line
                )));
            }
            match line.split_once(RENAME_SEPARATOR) {
                Some((src, dst)) => {
                    txn.rename = Some((PathBuf::from(src), PathBuf::from(dst)));
                }
                None => txn.remove.push(PathBuf::from(line)),
            }
        }
        Ok(txn)
    }
}

/// Resolves `rel` inside `table`, rejecting paths that would escape it.
fn resolve(table: &Path, rel: &Path) -> Result<PathBuf> {
    let valid = rel.components().count() > 0
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(Error::corruption(format!(
            "invalid path {:?} in transaction; it must point inside {}",
            rel,
            table.display()
        )));
    }
    Ok(table.join(rel))
}

/// Atomically writes `txn` as `txn/<idx>` and returns its path.
pub(crate) fn write_transaction(table: &Path, idx: u64, txn: &Transaction) -> Result<PathBuf> {
    let path = table.join(TXN_DIRNAME).join(format!("{:016X}", idx));
    fs::write_atomic(&path, txn.marshal().as_bytes()).map_err(|e| Error::io_at(e, "write", &path))?;
    Ok(path)
}

/// Applies the transaction stored at `txn_path` and deletes it.
///
/// Removals that hit transient NFS errors continue on a background thread
/// tracked by `removals`; the transaction file is deleted only after they
/// finish.
pub(crate) fn run_transaction(table: &Path, txn_path: &Path, removals: &Arc<TaskGroup>) -> Result<()> {
    let data = std::fs::read_to_string(txn_path).map_err(|e| Error::io_at(e, "read", txn_path))?;
    let txn = Transaction::parse(&data)
        .map_err(|e| Error::corruption(format!("cannot parse {}: {}", txn_path.display(), e)))?;

    let mut pending = Vec::new();
    for rel in &txn.remove {
        let path = resolve(table, rel)?;
        let (renamed, done) =
            fs::remove_dir_atomic(&path).map_err(|e| Error::io_at(e, "remove", &path))?;
        if !done {
            pending.push(renamed);
        }
    }

    if let Some((src, dst)) = &txn.rename {
        let src = resolve(table, src)?;
        let dst = resolve(table, dst)?;
        if src.exists() {
            std::fs::rename(&src, &dst).map_err(|e| Error::io_at(e, "rename", &src))?;
        } else if dst.exists() {
            // The rename completed before a crash.
            log::info!(
                "{} was already renamed to {} before the transaction {} was deleted",
                src.display(),
                dst.display(),
                txn_path.display()
            );
        } else {
            return Err(Error::corruption(format!(
                "cannot apply {}: neither {} nor {} exists",
                txn_path.display(),
                src.display(),
                dst.display()
            )));
        }
    }
    fs::sync_path(table).map_err(|e| Error::io_at(e, "sync", table))?;

    if pending.is_empty() {
        return remove_txn_file(txn_path);
    }

    log::warn!(
        "{} part directories from {} couldn't be removed yet; retrying in background",
        pending.len(),
        txn_path.display()
    );
    let txn_path_owned = txn_path.to_path_buf();
    let spawned = removals.spawn("mergeset-remove", move || {
        for path in &pending {
            if let Err(e) = fs::remove_dir_all_with_retry(path) {
                log::error!("cannot remove {}: {}", path.display(), e);
                return;
            }
        }
        if let Err(e) = remove_txn_file(&txn_path_owned) {
            log::error!("{}", e);
        }
    });
    spawned.map_err(|e| Error::io_at(e, "spawn removal thread for", txn_path))
}

fn remove_txn_file(txn_path: &Path) -> Result<()> {
    std::fs::remove_file(txn_path).map_err(|e| Error::io_at(e, "remove", txn_path))?;
    if let Some(dir) = txn_path.parent() {
        fs::sync_path(dir).map_err(|e| Error::io_at(e, "sync", dir))?;
    }
    Ok(())
}

/// Replays every transaction left in `txn/`, oldest first.
pub(crate) fn run_transactions(table: &Path, removals: &Arc<TaskGroup>) -> Result<usize> {
    let dir = table.join(TXN_DIRNAME);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::io_at(e, "read", &dir)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_at(e, "read", &dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if fs::is_temporary_file_name(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    for name in &names {
        run_transaction(table, &dir.join(name), removals)?;
    }
    Ok(names.len())
}
