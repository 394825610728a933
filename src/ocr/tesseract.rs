//! Tesseract OCR engine.
//!
//! We run `tesseract <image> stdout -l <lang> tsv` and group the word-level
//! rows into lines. Each line becomes one [`TextRegion`]; the region merger
//! takes care of joining lines into bubbles.

use std::collections::HashMap;

use tokio::process::Command;

use crate::{
    async_utils::{DEFAULT_ERROR_REGEX, check_for_command_failure},
    cpu_limit::with_cpu_semaphore,
    page::PageImage,
    prelude::*,
    regions::{BoundingBox, TextRegion},
};

use super::OcrEngine;

/// TSV `level` value for individual words.
const WORD_LEVEL: &str = "5";

/// Scripts written without spaces between words.
const UNSPACED_LANG_PREFIXES: &[&str] = &["jpn", "chi", "tha", "lao", "mya"];

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractOcrEngine {
    /// Value for `-l`.
    lang: String,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(lang: &str) -> Self {
        Self {
            lang: lang.to_owned(),
        }
    }

    /// The string we put between words on a line.
    fn word_separator(&self) -> &'static str {
        let unspaced = self.lang.split('+').next().is_some_and(|primary| {
            UNSPACED_LANG_PREFIXES
                .iter()
                .any(|prefix| primary.starts_with(prefix))
        });
        if unspaced { "" } else { " " }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    async fn ensure_ready(&self) -> Result<()> {
        let output = Command::new("tesseract")
            .arg("--version")
            .output()
            .await
            .context("cannot run tesseract (is it installed and on your PATH?)")?;
        check_for_command_failure("tesseract", &output, None)
    }

    #[instrument(level = "debug", skip_all, fields(path = %page.path.display()))]
    async fn detect(&self, page: &PageImage) -> Result<Vec<TextRegion>> {
        let output = with_cpu_semaphore(|| async {
            Command::new("tesseract")
                .arg(&page.path)
                .arg("stdout")
                .arg("-l")
                .arg(&self.lang)
                .arg("tsv")
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, Some(&*DEFAULT_ERROR_REGEX))?;
        let tsv = String::from_utf8_lossy(&output.stdout);
        let regions = parse_tsv_lines(&tsv, self.word_separator(), Some(&self.lang))?;
        debug!(regions = regions.len(), "Tesseract found text");
        Ok(regions)
    }
}

/// Accumulates the words of one TSV line.
struct LineBuilder {
    words: Vec<String>,
    bbox: BoundingBox,
    confidences: Vec<f32>,
}

/// Group tesseract TSV word rows into one region per line, in the order
/// lines first appear.
fn parse_tsv_lines(
    tsv: &str,
    separator: &str,
    lang: Option<&str>,
) -> Result<Vec<TextRegion>> {
    let mut order: Vec<(u32, u32, u32, u32)> = vec![];
    let mut lines: HashMap<(u32, u32, u32, u32), LineBuilder> = HashMap::new();

    // Skip the header row.
    for (row_idx, row) in tsv.lines().enumerate().skip(1) {
        let fields = row.split('\t').collect::<Vec<_>>();
        if fields.len() < 12 || fields[0] != WORD_LEVEL {
            continue;
        }
        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }
        let parse_u32 = |idx: usize| -> Result<u32> {
            fields[idx].parse::<u32>().with_context(|| {
                format!("bad tesseract TSV field {} on row {}", idx, row_idx)
            })
        };
        let parse_i32 = |idx: usize| -> Result<i32> {
            fields[idx].parse::<i32>().with_context(|| {
                format!("bad tesseract TSV field {} on row {}", idx, row_idx)
            })
        };
        let key = (parse_u32(1)?, parse_u32(2)?, parse_u32(3)?, parse_u32(4)?);
        let (left, top) = (parse_i32(6)?, parse_i32(7)?);
        let bbox = BoundingBox::new(left, top, left + parse_i32(8)?, top + parse_i32(9)?);
        let confidence = fields[10].parse::<f32>().ok().filter(|c| *c >= 0.0);

        let line = lines.entry(key).or_insert_with(|| {
            order.push(key);
            LineBuilder {
                words: vec![],
                bbox,
                confidences: vec![],
            }
        });
        line.words.push(text.to_owned());
        line.bbox = line.bbox.union(&bbox);
        line.confidences.extend(confidence);
    }

    Ok(order
        .into_iter()
        .filter_map(|key| lines.remove(&key))
        .map(|line| {
            let confidence = if line.confidences.is_empty() {
                None
            } else {
                Some(line.confidences.iter().sum::<f32>() / line.confidences.len() as f32)
            };
            TextRegion {
                text: line.words.join(separator),
                bbox: line.bbox,
                lang: lang.map(str::to_owned),
                confidence,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn groups_words_into_lines() {
        let tsv = [
            HEADER,
            "1\t1\t0\t0\t0\t0\t0\t0\t800\t1200\t-1\t",
            "4\t1\t1\t1\t1\t0\t10\t10\t200\t30\t-1\t",
            "5\t1\t1\t1\t1\t1\t10\t10\t80\t30\t90\tHello",
            "5\t1\t1\t1\t1\t2\t100\t12\t110\t28\t70\tthere",
            "5\t1\t2\t1\t1\t1\t300\t400\t50\t20\t60\tBye",
        ]
        .join("\n");
        let regions = parse_tsv_lines(&tsv, " ", Some("eng")).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].text, "Hello there");
        assert_eq!(regions[0].bbox, BoundingBox::new(10, 10, 210, 40));
        assert_eq!(regions[0].confidence, Some(80.0));
        assert_eq!(regions[0].lang.as_deref(), Some("eng"));
        assert_eq!(regions[1].text, "Bye");
    }

    #[test]
    fn skips_blank_words_and_tolerates_empty_output() {
        let tsv = [HEADER, "5\t1\t1\t1\t1\t1\t10\t10\t80\t30\t-1\t  "].join("\n");
        assert!(parse_tsv_lines(&tsv, "", None).unwrap().is_empty());
        assert!(parse_tsv_lines("", "", None).unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_coordinates() {
        let tsv = [HEADER, "5\t1\t1\t1\t1\t1\tten\t10\t80\t30\t90\tword"].join("\n");
        assert!(parse_tsv_lines(&tsv, " ", None).is_err());
    }

    #[test]
    fn japanese_words_are_not_spaced() {
        assert_eq!(TesseractOcrEngine::new("jpn_vert").word_separator(), "");
        assert_eq!(TesseractOcrEngine::new("jpn+eng").word_separator(), "");
        assert_eq!(TesseractOcrEngine::new("eng").word_separator(), " ");
    }
}
