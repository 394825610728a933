//! Finding the pages to translate.
//!
//! An input folder is either a single chapter (a flat folder of page
//! images) or a series (a folder of chapter folders). We discover every
//! page up front, in reading order, so that the pipeline knows how much
//! work it has before it starts.
//!
//! Everything here is synchronous filesystem access. Async callers should
//! run it on the blocking pool.

use std::{
    error, fmt, fs,
    sync::LazyLock,
};

use regex::Regex;

use crate::prelude::*;

/// Extensions we treat as page images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Suffix appended to the input folder name to get the output folder name.
const OUTPUT_SUFFIX: &str = "-translated";

/// Folder names which look like chapters: anything containing "chapter", or
/// starting with "ch" followed by a digit.
static CHAPTER_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(chapter|^ch\d)").expect("failed to compile regex")
});

/// What kind of input folder we were given.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderKind {
    /// A folder directly containing page images.
    SingleChapter,
    /// A folder containing chapter folders.
    Series,
    /// Neither.
    Invalid,
}

impl fmt::Display for FolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FolderKind::SingleChapter => write!(f, "single chapter"),
            FolderKind::Series => write!(f, "series"),
            FolderKind::Invalid => write!(f, "invalid"),
        }
    }
}

/// Why an input folder can't be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The input path does not exist.
    InputMissing(PathBuf),
    /// The input path is not a directory.
    NotADirectory(PathBuf),
    /// The output folder already exists and has something in it.
    OutputNotEmpty(PathBuf),
    /// The input is neither a chapter nor a series.
    InvalidStructure(PathBuf),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::InputMissing(path) => {
                write!(f, "input folder {} does not exist", path.display())
            }
            ScanError::NotADirectory(path) => {
                write!(f, "input {} is not a folder", path.display())
            }
            ScanError::OutputNotEmpty(path) => write!(
                f,
                "output folder {} already exists and is not empty",
                path.display()
            ),
            ScanError::InvalidStructure(path) => write!(
                f,
                "invalid folder structure: {} contains neither page images nor chapter folders",
                path.display()
            ),
        }
    }
}

impl error::Error for ScanError {}

/// A discovered page image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageFile {
    /// Absolute path to the image.
    pub path: PathBuf,

    /// Path relative to the input root. The output is written to the same
    /// relative path under the output root.
    pub relative_path: PathBuf,

    /// Name of the chapter folder containing this page.
    pub chapter: String,

    /// Position of this page within its chapter, starting at 0.
    pub index: usize,
}

/// A chapter and its pages, in reading order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chapter {
    /// The chapter folder name.
    pub name: String,

    /// Chapter folder relative to the input root (empty for a single chapter).
    pub relative_dir: PathBuf,

    /// Pages in reading order.
    pub images: Vec<ImageFile>,
}

/// The result of scanning an input folder.
#[derive(Clone, Debug)]
pub struct ScanResult {
    pub kind: FolderKind,
    pub chapters: Vec<Chapter>,
}

impl ScanResult {
    /// Every page, chapter by chapter, in reading order.
    pub fn images(&self) -> impl Iterator<Item = &ImageFile> {
        self.chapters.iter().flat_map(|chapter| chapter.images.iter())
    }

    /// Total number of pages.
    pub fn image_count(&self) -> usize {
        self.chapters.iter().map(|chapter| chapter.images.len()).sum()
    }
}

/// An input folder which has passed [`validate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedInput {
    /// Absolute input path.
    pub input: PathBuf,
    /// Where the translated pages will go.
    pub output: PathBuf,
    pub kind: FolderKind,
}

/// Does `path` have one of our image extensions?
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Does this folder name look like a chapter?
pub fn is_chapter_name(name: &str) -> bool {
    CHAPTER_NAME_REGEX.is_match(name)
}

/// Sort key for natural ordering: all the digits in `name`, read as one
/// number. Names without digits (or with absurdly long digit runs) sort last.
pub fn natural_sort_key(name: &str) -> u128 {
    let digits = name
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    digits.parse::<u128>().unwrap_or(u128::MAX)
}

/// List the visible entries of `dir`, sorted by name so that ties in
/// [`natural_sort_key`] always break the same way.
fn list_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            !path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with('.'))
        })
        .collect::<Vec<_>>();
    entries.sort();
    Ok(entries)
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Page images directly inside `dir`, in natural order.
fn chapter_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = list_dir(dir)?
        .into_iter()
        .filter(|path| path.is_file() && is_image_file(path))
        .collect::<Vec<_>>();
    // `sort_by_key` is stable.
    images.sort_by_key(|path| natural_sort_key(&file_stem_string(path)));
    Ok(images)
}

/// Chapter-like subfolders of `dir`, in natural order.
fn chapter_dirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = list_dir(dir)?
        .into_iter()
        .filter(|path| path.is_dir() && is_chapter_name(&file_name_string(path)))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|path| natural_sort_key(&file_name_string(path)));
    Ok(dirs)
}

/// Is `dir` a chapter, a series, or neither?
pub fn classify(dir: &Path) -> FolderKind {
    if !dir.is_dir() {
        return FolderKind::Invalid;
    }
    if chapter_images(dir).is_ok_and(|images| !images.is_empty()) {
        FolderKind::SingleChapter
    } else if chapter_dirs(dir).is_ok_and(|dirs| !dirs.is_empty()) {
        FolderKind::Series
    } else {
        FolderKind::Invalid
    }
}

/// Where we write output for `input`: a sibling folder named
/// `<input name>-translated`.
pub fn output_path_for(input: &Path) -> Result<PathBuf> {
    let input = std::path::absolute(input)
        .with_context(|| format!("cannot make {:?} absolute", input))?;
    let name = input
        .file_name()
        .ok_or_else(|| anyhow!("{:?} has no folder name", input))?;
    let mut output_name = name.to_os_string();
    output_name.push(OUTPUT_SUFFIX);
    Ok(match input.parent() {
        Some(parent) => parent.join(output_name),
        None => PathBuf::from(output_name),
    })
}

/// Is `path` absent, or an empty directory?
fn is_absent_or_empty_dir(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(err) => err.kind() == std::io::ErrorKind::NotFound,
    }
}

/// Check that `input` can be processed, and work out where output goes.
///
/// This must pass before anything is written, so that we never write into
/// an existing, non-empty output tree.
#[instrument(level = "debug", skip_all, fields(input = %input.display()))]
pub fn validate(input: &Path) -> Result<ValidatedInput, ScanError> {
    if !input.exists() {
        return Err(ScanError::InputMissing(input.to_owned()));
    }
    if !input.is_dir() {
        return Err(ScanError::NotADirectory(input.to_owned()));
    }
    let kind = classify(input);
    if kind == FolderKind::Invalid {
        return Err(ScanError::InvalidStructure(input.to_owned()));
    }
    let absolute = std::path::absolute(input)
        .map_err(|_| ScanError::InputMissing(input.to_owned()))?;
    let output = output_path_for(&absolute)
        .map_err(|_| ScanError::InvalidStructure(input.to_owned()))?;
    if !is_absent_or_empty_dir(&output) {
        return Err(ScanError::OutputNotEmpty(output));
    }
    Ok(ValidatedInput {
        input: absolute,
        output,
        kind,
    })
}

/// Build a [`Chapter`] from the images in `dir`.
fn scan_chapter(dir: &Path, relative_dir: PathBuf) -> std::io::Result<Chapter> {
    let name = file_name_string(dir);
    let images = chapter_images(dir)?
        .into_iter()
        .enumerate()
        .map(|(index, path)| ImageFile {
            relative_path: relative_dir.join(file_name_string(&path)),
            path,
            chapter: name.clone(),
            index,
        })
        .collect();
    Ok(Chapter {
        name,
        relative_dir,
        images,
    })
}

/// Discover every page under `root`, grouped by chapter, in reading order.
#[instrument(level = "debug", skip_all, fields(root = %root.display()))]
pub fn scan(root: &Path) -> Result<ScanResult> {
    let kind = classify(root);
    let chapters = match kind {
        FolderKind::SingleChapter => vec![
            scan_chapter(root, PathBuf::new())
                .with_context(|| format!("cannot read chapter {:?}", root))?,
        ],
        FolderKind::Series => {
            let mut chapters = vec![];
            for dir in chapter_dirs(root)
                .with_context(|| format!("cannot read series {:?}", root))?
            {
                let chapter = scan_chapter(&dir, PathBuf::from(file_name_string(&dir)))
                    .with_context(|| format!("cannot read chapter {:?}", dir))?;
                if chapter.images.is_empty() {
                    debug!(chapter = %chapter.name, "Skipping chapter folder without images");
                    continue;
                }
                chapters.push(chapter);
            }
            chapters
        }
        FolderKind::Invalid => {
            return Err(ScanError::InvalidStructure(root.to_owned()).into());
        }
    };
    let result = ScanResult { kind, chapters };
    debug!(
        chapters = result.chapters.len(),
        images = result.image_count(),
        "Scanned input"
    );
    Ok(result)
}
