//! Project file conversion.
//!
//! Before a project file is exported its media references are rewritten to
//! point at the exported copies. The converter is supplied by the host and is
//! not required to be thread-safe, so the operation hands it work through a
//! `ConversionRequest` that the host runs on its own thread.

use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;

/// Rewrites media references inside a project file.
pub trait ProjectConverter {
    /// Write a copy of `project` to `output` with every `(source, destination)`
    /// reference in `rewrites` replaced.
    fn convert(
        &mut self,
        project: &Path,
        rewrites: &[(PathBuf, PathBuf)],
        output: &Path,
    ) -> Result<(), String>;
}

/// Converter for text-based project formats: plain string substitution.
#[derive(Debug, Default)]
pub struct TextPathRewriter;

impl ProjectConverter for TextPathRewriter {
    fn convert(
        &mut self,
        project: &Path,
        rewrites: &[(PathBuf, PathBuf)],
        output: &Path,
    ) -> Result<(), String> {
        let mut text = fs::read_to_string(project)
            .map_err(|e| format!("Cannot read project file {}: {}", project.display(), e))?;

        // Longest source first so a path never clobbers a longer one it prefixes.
        let mut ordered: Vec<(String, String)> = rewrites
            .iter()
            .map(|(from, to)| (from.to_string_lossy().into_owned(), to.to_string_lossy().into_owned()))
            .collect();
        ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        // Placeholders keep a replacement from being rewritten again by a
        // later, shorter source.
        let placeholders: Vec<String> = (0..ordered.len())
            .map(|i| format!("\u{0}export-path-{}\u{0}", i))
            .collect();
        for ((from, _), placeholder) in ordered.iter().zip(&placeholders) {
            if !from.is_empty() {
                text = text.replace(from.as_str(), placeholder);
            }
        }
        for ((_, to), placeholder) in ordered.iter().zip(&placeholders) {
            text = text.replace(placeholder.as_str(), to);
        }

        fs::write(output, text)
            .map_err(|e| format!("Cannot write converted project {}: {}", output.display(), e))
    }
}

/// A conversion the worker needs run on the caller's thread.
#[derive(Debug)]
pub struct ConversionRequest {
    pub project: PathBuf,
    pub rewrites: Vec<(PathBuf, PathBuf)>,
    pub output: PathBuf,
    reply: Sender<Result<(), String>>,
}

impl ConversionRequest {
    pub(crate) fn new(
        project: PathBuf,
        rewrites: Vec<(PathBuf, PathBuf)>,
        output: PathBuf,
        reply: Sender<Result<(), String>>,
    ) -> Self {
        ConversionRequest {
            project,
            rewrites,
            output,
            reply,
        }
    }

    /// Run the conversion and hand the result back to the worker.
    pub fn run(self, converter: &mut dyn ProjectConverter) {
        let result = converter.convert(&self.project, &self.rewrites, &self.output);
        let _ = self.reply.send(result);
    }

    /// Tell the worker the conversion will not happen.
    pub fn decline(self, reason: impl Into<String>) {
        let _ = self.reply.send(Err(reason.into()));
    }
}
