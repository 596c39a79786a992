//! Destination path uniquifier.
//!
//! Every media source is exported under `media_root / top_level / rest`, where
//! `top_level` is the first path component below the source's stem. Two
//! sources from different stems can share a top-level name (two cards that
//! both have a `video` folder); the later stem is given a suffixed name so
//! nothing at the destination is shared or overwritten by accident.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{top_level_name, DestinationPathMap, ExportItem, MediaSource};

/// One top-level rename made to resolve a collision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopLevelRename {
    pub stem: PathBuf,
    pub original: String,
    pub renamed: String,
}

/// The export manifest plus the renames it required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqueExportMap {
    pub items: DestinationPathMap,
    pub renames: Vec<TopLevelRename>,
}

impl UniqueExportMap {
    /// Every `(source file, destination file)` pair, in transfer order.
    pub fn destinations(&self, media_root: &Path) -> Vec<(PathBuf, PathBuf)> {
        self.items
            .values()
            .flat_map(|item| {
                item.export_file_paths.iter().filter_map(move |file| {
                    item.destination_for(file, media_root)
                        .map(|dest| (file.clone(), dest))
                })
            })
            .collect()
    }

    /// Number of concrete paths to transfer.
    pub fn file_count(&self) -> usize {
        self.items.values().map(|i| i.export_file_paths.len()).sum()
    }
}

/// Build the export manifest for `sources`.
///
/// The result only depends on the order of `sources`: the first stem to use
/// a top-level name keeps it, later stems get `-a`, `-b`, ... suffixes.
///
/// # Errors
/// `SourceNotFound` if a media path or sidecar does not exist, `InvalidPath`
/// if a media path does not lie under its stem.
pub fn build_export_map(sources: &[MediaSource]) -> Result<UniqueExportMap, EngineError> {
    let mut items: DestinationPathMap = BTreeMap::new();
    let mut item_order: Vec<PathBuf> = Vec::new();

    for source in sources {
        if !source.media_path.exists() {
            return Err(EngineError::SourceNotFound {
                path: source.media_path.clone(),
            });
        }
        if top_level_name(&source.media_path, &source.stem).is_none() {
            return Err(EngineError::InvalidPath {
                path: source.media_path.clone(),
                reason: format!("not below stem {}", source.stem.display()),
            });
        }

        let mut paths = if source.media_path.is_dir() {
            fs_ops::enumerate_tree(&source.media_path)?
        } else {
            vec![source.media_path.clone()]
        };
        for sidecar in &source.sidecars {
            if !sidecar.exists() {
                return Err(EngineError::SourceNotFound {
                    path: sidecar.clone(),
                });
            }
            if top_level_name(sidecar, &source.stem).is_none() {
                return Err(EngineError::InvalidPath {
                    path: sidecar.clone(),
                    reason: format!("not below stem {}", source.stem.display()),
                });
            }
            if !paths.contains(sidecar) {
                paths.push(sidecar.clone());
            }
        }

        if items.contains_key(&source.media_path) {
            debug!(path = %source.media_path.display(), "duplicate media source ignored");
            continue;
        }
        item_order.push(source.media_path.clone());
        items.insert(
            source.media_path.clone(),
            ExportItem {
                source_stem: source.stem.clone(),
                export_file_paths: paths,
                top_level_names: BTreeMap::new(),
            },
        );
    }

    // Top-level names per stem, both in first-seen order.
    let mut stems: Vec<PathBuf> = Vec::new();
    let mut names_by_stem: HashMap<PathBuf, Vec<String>> = HashMap::new();
    for media_path in &item_order {
        let item = &items[media_path];
        if !names_by_stem.contains_key(&item.source_stem) {
            stems.push(item.source_stem.clone());
        }
        let names = names_by_stem.entry(item.source_stem.clone()).or_default();
        for file in &item.export_file_paths {
            if let Some(name) = top_level_name(file, &item.source_stem) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }

    // Every original name is off limits to renames, including names a stem
    // has not reached yet.
    let reserved: HashSet<String> = names_by_stem
        .values()
        .flatten()
        .map(|name| name.to_lowercase())
        .collect();

    // Claimed names, lowercased, with the stem that owns them.
    let mut taken: HashMap<String, PathBuf> = HashMap::new();
    let mut renames_by_stem: HashMap<PathBuf, BTreeMap<String, String>> = HashMap::new();
    let mut renames = Vec::new();

    for stem in &stems {
        for name in &names_by_stem[stem] {
            let key = name.to_lowercase();
            match taken.get(&key).cloned() {
                Some(owner) if &owner != stem => {
                    let renamed = unique_name(name, |candidate| {
                        let key = candidate.to_lowercase();
                        reserved.contains(&key) || taken.contains_key(&key)
                    });
                    debug!(
                        stem = %stem.display(),
                        original = %name,
                        renamed = %renamed,
                        "top-level name collision"
                    );
                    taken.insert(renamed.to_lowercase(), stem.clone());
                    renames_by_stem
                        .entry(stem.clone())
                        .or_default()
                        .insert(name.clone(), renamed.clone());
                    renames.push(TopLevelRename {
                        stem: stem.clone(),
                        original: name.clone(),
                        renamed,
                    });
                }
                Some(_) => {}
                None => {
                    taken.insert(key, stem.clone());
                }
            }
        }
    }

    for item in items.values_mut() {
        if let Some(stem_renames) = renames_by_stem.get(&item.source_stem) {
            let own: HashSet<String> = item
                .export_file_paths
                .iter()
                .filter_map(|f| top_level_name(f, &item.source_stem))
                .collect();
            item.top_level_names = stem_renames
                .iter()
                .filter(|(original, _)| own.contains(*original))
                .map(|(a, b)| (a.clone(), b.clone()))
                .collect();
        }
    }

    Ok(UniqueExportMap { items, renames })
}

/// First suffixed variant of `name` that `is_taken` rejects.
///
/// The suffix goes before the extension: `clip.mov` -> `clip-a.mov`,
/// `video` -> `video-a`.
fn unique_name(name: &str, is_taken: impl Fn(&str) -> bool) -> String {
    let (base, extension) = split_extension(name);
    let mut index = 0usize;
    loop {
        let candidate = format!("{}-{}{}", base, letter_suffix(index), extension);
        if !is_taken(&candidate) {
            return candidate;
        }
        index += 1;
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        // Leading dot is a hidden file, not an extension
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// 0 -> "a", 25 -> "z", 26 -> "aa", 27 -> "ab", ...
fn letter_suffix(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'a' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}
