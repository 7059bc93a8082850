use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading seeds or writing campaign artifacts.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred on the given path.
    #[error("Corpus I/O error on {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    /// An artifact sidecar or statistics file could not be serialized.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),
}

impl CorpusError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        CorpusError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Serialization(format!("JSON operation error: {}", err))
    }
}

pub const CORPUS_DIR: &str = "corpus";
pub const FAILURES_DIR: &str = "failures";
pub const ALL_INPUTS_DIR: &str = "all";
pub const STATS_FILE: &str = "fuzz_stats.json";

/// Where failing inputs of a campaign rooted at `results_dir` are stored.
pub fn failures_dir(results_dir: &Path) -> PathBuf {
    results_dir.join(FAILURES_DIR)
}

/// Metadata written next to every saved failing input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Trial number (1-based) that produced the failure.
    pub trial: u64,
    pub kind: String,
    pub cause: Option<String>,
    /// File name of the input inside the failures directory.
    pub input_file: String,
}

/// On-disk layout of a campaign's results directory.
///
/// ```text
/// <results>/corpus/id_000000        inputs that reached new coverage
/// <results>/failures/id_000000      unique failing inputs
/// <results>/failures/id_000000.json FailureRecord for the input above
/// <results>/all/id_000000           every input, only when saving all inputs
/// <results>/fuzz_stats.json         final statistics
/// ```
///
/// Opening a store clears artifacts left by an earlier campaign in the same directory.
#[derive(Debug)]
pub struct ResultsStore {
    root: PathBuf,
    corpus_count: usize,
    failure_count: usize,
    all_count: Option<usize>,
}

impl ResultsStore {
    pub fn open(root: &Path, save_all: bool) -> Result<Self, CorpusError> {
        let mut dirs = vec![CORPUS_DIR, FAILURES_DIR];
        if save_all {
            dirs.push(ALL_INPUTS_DIR);
        }
        for name in dirs {
            let dir = root.join(name);
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| CorpusError::io(&dir, e))?;
            }
            fs::create_dir_all(&dir).map_err(|e| CorpusError::io(&dir, e))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            corpus_count: 0,
            failure_count: 0,
            all_count: save_all.then_some(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus_count
    }

    pub fn failure_len(&self) -> usize {
        self.failure_count
    }

    pub fn save_corpus(&mut self, input: &[u8]) -> Result<PathBuf, CorpusError> {
        let path = self.root.join(CORPUS_DIR).join(entry_name(self.corpus_count));
        write_file(&path, input)?;
        self.corpus_count += 1;
        Ok(path)
    }

    /// Records `input` when saving all inputs is enabled, otherwise does nothing.
    pub fn save_any(&mut self, input: &[u8]) -> Result<Option<PathBuf>, CorpusError> {
        let Some(count) = self.all_count.as_mut() else {
            return Ok(None);
        };
        let path = self.root.join(ALL_INPUTS_DIR).join(entry_name(*count));
        write_file(&path, input)?;
        *count += 1;
        Ok(Some(path))
    }

    pub fn save_failure(
        &mut self,
        input: &[u8],
        trial: u64,
        kind: &str,
        cause: Option<&str>,
    ) -> Result<PathBuf, CorpusError> {
        let name = entry_name(self.failure_count);
        let dir = failures_dir(&self.root);
        let path = dir.join(&name);
        write_file(&path, input)?;

        let record = FailureRecord {
            trial,
            kind: kind.to_string(),
            cause: cause.map(String::from),
            input_file: name.clone(),
        };
        write_json(&dir.join(format!("{name}.json")), &record)?;

        self.failure_count += 1;
        Ok(path)
    }

    pub fn write_stats<T: Serialize>(&self, stats: &T) -> Result<PathBuf, CorpusError> {
        let path = self.root.join(STATS_FILE);
        write_json(&path, stats)?;
        Ok(path)
    }
}

fn entry_name(id: usize) -> String {
    format!("id_{:06}", id)
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), CorpusError> {
    let mut file = File::create(path).map_err(|e| CorpusError::io(path, e))?;
    file.write_all(data).map_err(|e| CorpusError::io(path, e))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CorpusError> {
    let file = File::create(path).map_err(|e| CorpusError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|e| CorpusError::io(path, e))
}

/// Reads every regular file directly inside `dir` (no recursion), ordered by file name.
pub fn load_seed_inputs(dir: &Path) -> Result<Vec<Vec<u8>>, CorpusError> {
    let mut paths = Vec::new();
    for entry_result in fs::read_dir(dir).map_err(|e| CorpusError::io(dir, e))? {
        let entry = entry_result.map_err(|e| CorpusError::io(dir, e))?;
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|path| fs::read(path).map_err(|e| CorpusError::io(path, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout_and_clears_previous_artifacts() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join(CORPUS_DIR).join("stale");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"old").unwrap();

        let store = ResultsStore::open(dir.path(), false).unwrap();
        assert!(dir.path().join(CORPUS_DIR).is_dir());
        assert!(dir.path().join(FAILURES_DIR).is_dir());
        assert!(!dir.path().join(ALL_INPUTS_DIR).exists());
        assert!(!stale.exists());
        assert_eq!(store.corpus_len(), 0);
    }

    #[test]
    fn corpus_and_all_inputs_are_numbered() {
        let dir = tempdir().unwrap();
        let mut store = ResultsStore::open(dir.path(), true).unwrap();
        let first = store.save_corpus(b"one").unwrap();
        let second = store.save_corpus(b"two").unwrap();
        assert!(first.ends_with("corpus/id_000000"));
        assert!(second.ends_with("corpus/id_000001"));
        assert_eq!(fs::read(&second).unwrap(), b"two");

        let all = store.save_any(b"x").unwrap().unwrap();
        assert!(all.ends_with("all/id_000000"));
        assert_eq!(store.corpus_len(), 2);
    }

    #[test]
    fn save_any_is_a_noop_without_save_all() {
        let dir = tempdir().unwrap();
        let mut store = ResultsStore::open(dir.path(), false).unwrap();
        assert_eq!(store.save_any(b"x").unwrap(), None);
    }

    #[test]
    fn failures_get_a_json_sidecar() {
        let dir = tempdir().unwrap();
        let mut store = ResultsStore::open(dir.path(), false).unwrap();
        let path = store
            .save_failure(b"BAD", 7, "uncaught-error", Some("boom"))
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"BAD");

        let sidecar = failures_dir(dir.path()).join("id_000000.json");
        let record: FailureRecord =
            serde_json::from_str(&fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(
            record,
            FailureRecord {
                trial: 7,
                kind: "uncaught-error".to_string(),
                cause: Some("boom".to_string()),
                input_file: "id_000000".to_string(),
            }
        );
        assert_eq!(store.failure_len(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn json_write_errors_surface_on_flush() {
        let record = FailureRecord {
            trial: 1,
            kind: "uncaught-error".to_string(),
            cause: None,
            input_file: "id_000000".to_string(),
        };
        match write_json(Path::new("/dev/full"), &record) {
            Err(CorpusError::Io { path, .. }) => assert_eq!(path, PathBuf::from("/dev/full")),
            other => panic!("Expected an I/O error, got {other:?}"),
        }
    }

    #[test]
    fn seeds_are_loaded_in_name_order_without_recursion() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b"), b"second").unwrap();
        fs::write(dir.path().join("a"), b"first").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c"), b"ignored").unwrap();

        let seeds = load_seed_inputs(dir.path()).unwrap();
        assert_eq!(seeds, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn missing_seed_dir_is_an_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_seed_inputs(&dir.path().join("missing")),
            Err(CorpusError::Io { .. })
        ));
    }
}
