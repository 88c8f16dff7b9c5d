//! The document being sanitized and its lifecycle.
//!
//! A [`Document`] is created from a validated input path, gets a short
//! process-unique id (used to name sandbox instances so concurrent jobs never
//! collide), and moves through
//!
//! ```text
//! Unconverted ──► Converting ──► Safe
//!      │               │
//!      └───────────────┴──────► Failed
//! ```
//!
//! Transitions only move forward. A state, once left, is never entered again.

use crate::error::SanitizeError;
use nix::unistd::{access, AccessFlags};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Suffix appended to the input stem to form the default output path.
pub const SAFE_EXTENSION: &str = "-safe.pdf";

/// Directory, next to the input, that receives archived originals.
pub const ARCHIVE_SUBDIR: &str = "unsafe";

const ID_LEN: usize = 6;
const ID_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Ids of every live [`Document`] in this process.
static LIVE_IDS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn random_id() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    bytes[..ID_LEN]
        .iter()
        .map(|b| char::from(ID_ALPHABET[usize::from(b & 63)]))
        .collect()
}

fn allocate_id() -> String {
    loop {
        let id = random_id();
        // A poisoned registry still holds a valid set.
        let mut live = LIVE_IDS.lock().unwrap_or_else(|e| e.into_inner());
        if live.insert(id.clone()) {
            return id;
        }
    }
}

/// Conversion state of a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Unconverted,
    Converting,
    Safe,
    Failed,
}

impl DocumentState {
    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(self, next: DocumentState) -> bool {
        use DocumentState::*;
        matches!(
            (self, next),
            (Unconverted, Converting) | (Unconverted, Failed) | (Converting, Safe) | (Converting, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentState::Safe | DocumentState::Failed)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentState::Unconverted => "unconverted",
            DocumentState::Converting => "converting",
            DocumentState::Safe => "safe",
            DocumentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One conversion job.
pub struct Document {
    id: String,
    input_path: PathBuf,
    output_path: Option<PathBuf>,
    suffix: String,
    state: DocumentState,
    history: Vec<DocumentState>,
    failure: Option<SanitizeError>,
    archive_after_conversion: bool,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("input_path", &self.input_path)
            .field("output_path", &self.output_path())
            .field("state", &self.state)
            .field("archive_after_conversion", &self.archive_after_conversion)
            .finish()
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        let mut live = LIVE_IDS.lock().unwrap_or_else(|e| e.into_inner());
        live.remove(&self.id);
    }
}

fn absolute(path: &Path) -> Result<PathBuf, SanitizeError> {
    std::path::absolute(path).map_err(|e| SanitizeError::io("resolving a path", e))
}

fn is_writable(dir: &Path) -> bool {
    access(dir, AccessFlags::W_OK).is_ok()
}

fn validate_input(path: &Path) -> Result<(), SanitizeError> {
    match std::fs::File::open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SanitizeError::InputNotFound {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            Err(SanitizeError::InputNotReadable {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(SanitizeError::io("opening the input document", e)),
    }
}

fn validate_output(path: &Path) -> Result<(), SanitizeError> {
    let is_pdf = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".pdf"));
    if !is_pdf {
        return Err(SanitizeError::NonPdfOutput {
            path: path.to_path_buf(),
        });
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    if !parent.exists() {
        return Err(SanitizeError::OutputDirNotFound {
            path: parent.to_path_buf(),
        });
    }
    if !parent.is_dir() {
        return Err(SanitizeError::OutputDirNotADirectory {
            path: parent.to_path_buf(),
        });
    }
    if !is_writable(parent) {
        return Err(SanitizeError::UnwritableOutputDir {
            path: parent.to_path_buf(),
        });
    }
    Ok(())
}

impl Document {
    /// Create a document for `input`, validating that it can be read.
    pub fn new(input: impl AsRef<Path>) -> Result<Self, SanitizeError> {
        let input_path = absolute(input.as_ref())?;
        validate_input(&input_path)?;
        let id = allocate_id();
        info!("Assigning ID '{}' to doc '{}'", id, input_path.display());
        Ok(Self {
            id,
            input_path,
            output_path: None,
            suffix: SAFE_EXTENSION.to_string(),
            state: DocumentState::Unconverted,
            history: vec![DocumentState::Unconverted],
            failure: None,
            archive_after_conversion: false,
        })
    }

    /// Create a document with an explicit output path.
    pub fn with_output(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<Self, SanitizeError> {
        let mut doc = Self::new(input)?;
        doc.set_output_path(output)?;
        Ok(doc)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// Explicit output path, or `<input stem><suffix>` next to the input.
    pub fn output_path(&self) -> PathBuf {
        match &self.output_path {
            Some(p) => p.clone(),
            None => self.default_output_path(),
        }
    }

    fn default_output_path(&self) -> PathBuf {
        let stem = self.input_path.with_extension("");
        let mut name = stem.into_os_string();
        name.push(&self.suffix);
        PathBuf::from(name)
    }

    /// Set the output path. It must end in `.pdf` and its directory must be
    /// writable.
    pub fn set_output_path(&mut self, output: impl AsRef<Path>) -> Result<(), SanitizeError> {
        let path = absolute(output.as_ref())?;
        validate_output(&path)?;
        self.output_path = Some(path);
        Ok(())
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Change the suffix of the default output path. Only allowed while no
    /// explicit output path is set, and the suffix must end in `.pdf`.
    pub fn set_suffix(&mut self, suffix: impl Into<String>) -> Result<(), SanitizeError> {
        if self.output_path.is_some() {
            return Err(SanitizeError::SuffixNotApplicable);
        }
        let suffix = suffix.into();
        if !suffix.ends_with(".pdf") {
            let mut name = self.input_path.with_extension("").into_os_string();
            name.push(&suffix);
            return Err(SanitizeError::NonPdfOutput {
                path: PathBuf::from(name),
            });
        }
        self.suffix = suffix;
        Ok(())
    }

    /// Check that the output path still ends in `.pdf` and that its
    /// directory exists and is writable.
    pub fn validate_output(&self) -> Result<(), SanitizeError> {
        validate_output(&self.output_path())
    }

    /// Keep the output file name, but place it in `dir`.
    pub fn set_output_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), SanitizeError> {
        let dir = absolute(dir.as_ref())?;
        if !dir.exists() {
            return Err(SanitizeError::OutputDirNotFound { path: dir });
        }
        if !dir.is_dir() {
            return Err(SanitizeError::OutputDirNotADirectory { path: dir });
        }
        if !is_writable(&dir) {
            return Err(SanitizeError::UnwritableOutputDir { path: dir });
        }
        let current = self.output_path();
        let name = current
            .file_name()
            .ok_or_else(|| SanitizeError::Internal("output path has no file name".into()))?;
        self.output_path = Some(dir.join(name));
        Ok(())
    }

    pub fn archive_after_conversion(&self) -> bool {
        self.archive_after_conversion
    }

    pub fn set_archive_after_conversion(&mut self, archive: bool) {
        self.archive_after_conversion = archive;
    }

    /// Where the original goes when archived.
    pub fn archive_path(&self) -> PathBuf {
        let parent = self.input_path.parent().unwrap_or_else(|| Path::new("/"));
        let name = self.input_path.file_name().unwrap_or_default();
        parent.join(ARCHIVE_SUBDIR).join(name)
    }

    /// Move the original input into the archive directory.
    pub async fn archive(&self) -> Result<PathBuf, SanitizeError> {
        let target = self.archive_path();
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|_| SanitizeError::UnwritableArchiveDir {
                    path: dir.to_path_buf(),
                })?;
        }
        tokio::fs::rename(&self.input_path, &target)
            .await
            .map_err(|e| SanitizeError::io("archiving the original document", e))?;
        info!(
            "[doc {}] Archived original to '{}'",
            self.id,
            target.display()
        );
        Ok(target)
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Every state this document has been in, oldest first.
    pub fn history(&self) -> &[DocumentState] {
        &self.history
    }

    /// The error that moved this document to [`DocumentState::Failed`].
    pub fn failure(&self) -> Option<&SanitizeError> {
        self.failure.as_ref()
    }

    pub fn is_unconverted(&self) -> bool {
        self.state == DocumentState::Unconverted
    }

    pub fn is_converting(&self) -> bool {
        self.state == DocumentState::Converting
    }

    pub fn is_safe(&self) -> bool {
        self.state == DocumentState::Safe
    }

    pub fn is_failed(&self) -> bool {
        self.state == DocumentState::Failed
    }

    fn transition(&mut self, next: DocumentState) -> Result<(), SanitizeError> {
        if !self.state.can_transition_to(next) {
            return Err(SanitizeError::Internal(format!(
                "illegal state transition {} -> {} for doc {}",
                self.state, next, self.id
            )));
        }
        debug!("Marking doc {} as '{}'", self.id, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    pub fn mark_as_converting(&mut self) -> Result<(), SanitizeError> {
        self.transition(DocumentState::Converting)
    }

    pub fn mark_as_safe(&mut self) -> Result<(), SanitizeError> {
        self.transition(DocumentState::Safe)
    }

    pub fn mark_as_failed(&mut self, error: SanitizeError) -> Result<(), SanitizeError> {
        self.transition(DocumentState::Failed)?;
        self.failure = Some(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, b"%PDF-1.4\n").unwrap();
        p
    }

    #[test]
    fn ids_are_short_and_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let docs: Vec<Document> = (0..64).map(|_| Document::new(&path).unwrap()).collect();
        let ids: HashSet<&str> = docs.iter().map(|d| d.id()).collect();
        assert_eq!(ids.len(), docs.len());
        for d in &docs {
            assert_eq!(d.id().len(), ID_LEN);
            assert!(d.id().bytes().all(|b| ID_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn dropped_ids_leave_the_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let doc = Document::new(&path).unwrap();
        let id = doc.id().to_string();
        assert!(LIVE_IDS.lock().unwrap().contains(&id));
        drop(doc);
        assert!(!LIVE_IDS.lock().unwrap().contains(&id));
    }

    #[test]
    fn default_output_and_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "report.docx");
        let mut doc = Document::new(&path).unwrap();
        assert_eq!(doc.output_path(), tmp.path().join("report-safe.pdf"));

        doc.set_suffix("-clean.pdf").unwrap();
        assert_eq!(doc.output_path(), tmp.path().join("report-clean.pdf"));

        doc.set_output_path(tmp.path().join("out.pdf")).unwrap();
        assert!(matches!(
            doc.set_suffix("-x.pdf"),
            Err(SanitizeError::SuffixNotApplicable)
        ));
    }

    #[test]
    fn suffix_must_keep_the_pdf_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let mut doc = Document::new(&path).unwrap();
        assert!(matches!(
            doc.set_suffix("-clean"),
            Err(SanitizeError::NonPdfOutput { .. })
        ));
        assert_eq!(doc.suffix(), SAFE_EXTENSION);
        assert!(doc.output_path().to_string_lossy().ends_with(".pdf"));
    }

    #[test]
    fn output_is_revalidated_on_demand() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let out_dir = tmp.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let mut doc = Document::new(&path).unwrap();
        doc.set_output_dir(&out_dir).unwrap();
        assert!(doc.validate_output().is_ok());

        std::fs::remove_dir(&out_dir).unwrap();
        assert!(matches!(
            doc.validate_output(),
            Err(SanitizeError::OutputDirNotFound { .. })
        ));
    }

    #[test]
    fn missing_input_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Document::new(tmp.path().join("nope.pdf")).unwrap_err();
        assert!(matches!(err, SanitizeError::InputNotFound { .. }));
    }

    #[test]
    fn output_must_be_pdf() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let err = Document::with_output(&path, tmp.path().join("out.txt")).unwrap_err();
        assert!(matches!(err, SanitizeError::NonPdfOutput { .. }));
    }

    #[test]
    fn output_dir_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let mut doc = Document::new(&path).unwrap();

        let missing = doc.set_output_dir(tmp.path().join("missing")).unwrap_err();
        assert!(matches!(missing, SanitizeError::OutputDirNotFound { .. }));

        let file = doc.set_output_dir(&path).unwrap_err();
        assert!(matches!(file, SanitizeError::OutputDirNotADirectory { .. }));

        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        doc.set_output_dir(&out).unwrap();
        assert_eq!(doc.output_path(), out.join("a-safe.pdf"));
    }

    #[test]
    fn states_only_move_forward() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let mut doc = Document::new(&path).unwrap();

        assert!(doc.mark_as_safe().is_err());
        doc.mark_as_converting().unwrap();
        assert!(doc.mark_as_converting().is_err());
        doc.mark_as_failed(SanitizeError::Cancelled).unwrap();
        assert!(doc.mark_as_safe().is_err());
        assert!(doc.mark_as_failed(SanitizeError::Cancelled).is_err());

        assert_eq!(
            doc.history(),
            &[
                DocumentState::Unconverted,
                DocumentState::Converting,
                DocumentState::Failed
            ]
        );
        assert!(matches!(doc.failure(), Some(SanitizeError::Cancelled)));
    }

    #[test]
    fn unconverted_can_fail_directly() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let mut doc = Document::new(&path).unwrap();
        doc.mark_as_failed(SanitizeError::Internal("x".into())).unwrap();
        assert!(doc.is_failed());
    }

    #[tokio::test]
    async fn archive_moves_input() {
        let tmp = tempfile::tempdir().unwrap();
        let path = input(tmp.path(), "a.pdf");
        let doc = Document::new(&path).unwrap();
        let target = doc.archive().await.unwrap();
        assert_eq!(target, tmp.path().join("unsafe").join("a.pdf"));
        assert!(target.exists());
        assert!(!path.exists());
    }
}
