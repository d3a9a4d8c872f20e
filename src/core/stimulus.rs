//! Stimuli and the catalog that enumerates them.

use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const PICTURE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tga", "webp"];

/// Something the engine can present.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Stimulus {
    Picture(u32),
    Keyword(u32),
    SynthParams(Vec<f32>),
}

impl Stimulus {
    pub fn key(&self) -> StimulusKey {
        match self {
            Stimulus::Picture(id) => StimulusKey::Picture(*id),
            Stimulus::Keyword(id) => StimulusKey::Keyword(*id),
            Stimulus::SynthParams(_) => StimulusKey::Synth,
        }
    }
}

/// Dataset/model address of a stimulus. Every synth vector shares one key
/// because the synth parameter space is continuous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StimulusKey {
    Picture(u32),
    Keyword(u32),
    Synth,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SynthSpec {
    pub name: String,
    pub param_count: usize,
}

/// Where to find the stimuli for a command.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CatalogSpec {
    /// Directory of images, or a text file listing one picture per line.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pictures: Option<PathBuf>,
    /// Text file with one keyword per line.
    #[cfg_attr(feature = "serde", serde(default))]
    pub keywords: Option<PathBuf>,
    /// Pictures listed inline, appended after any loaded from `pictures`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub picture_labels: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub keyword_labels: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub synth: Option<SynthSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct StimulusCatalog {
    pictures: Vec<String>,
    keywords: Vec<String>,
    synth: Option<SynthSpec>,
}

impl CatalogSpec {
    pub fn inline(pictures: &[&str], keywords: &[&str], synth: Option<SynthSpec>) -> Self {
        Self {
            picture_labels: pictures.iter().map(|s| s.to_string()).collect(),
            keyword_labels: keywords.iter().map(|s| s.to_string()).collect(),
            synth,
            ..Self::default()
        }
    }
}

impl StimulusCatalog {
    pub fn from_labels(
        pictures: Vec<String>,
        keywords: Vec<String>,
        synth: Option<SynthSpec>,
    ) -> Self {
        Self {
            pictures,
            keywords,
            synth: synth.filter(|s| s.param_count > 0),
        }
    }

    pub fn load(spec: &CatalogSpec) -> Result<Self, EngineError> {
        let mut pictures = match &spec.pictures {
            Some(p) => load_pictures(p)?,
            None => Vec::new(),
        };
        pictures.extend(spec.picture_labels.iter().cloned());
        let mut keywords = match &spec.keywords {
            Some(p) => read_lines(p)?,
            None => Vec::new(),
        };
        keywords.extend(spec.keyword_labels.iter().cloned());
        let catalog = Self::from_labels(pictures, keywords, spec.synth.clone());
        if catalog.is_empty() {
            return Err(EngineError::Catalog("catalog contains no stimuli".to_string()));
        }
        Ok(catalog)
    }

    pub fn picture_count(&self) -> usize {
        self.pictures.len()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    pub fn synth(&self) -> Option<&SynthSpec> {
        self.synth.as_ref()
    }

    pub fn synth_param_count(&self) -> usize {
        self.synth.as_ref().map(|s| s.param_count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty() && self.keywords.is_empty() && self.synth.is_none()
    }

    pub fn picture_keys(&self) -> impl Iterator<Item = StimulusKey> + '_ {
        (0..self.pictures.len() as u32).map(StimulusKey::Picture)
    }

    pub fn keyword_keys(&self) -> impl Iterator<Item = StimulusKey> + '_ {
        (0..self.keywords.len() as u32).map(StimulusKey::Keyword)
    }

    /// All pictures, then all keywords, then the synth model.
    pub fn training_order(&self) -> Vec<StimulusKey> {
        let mut order: Vec<StimulusKey> = self.picture_keys().chain(self.keyword_keys()).collect();
        if self.synth.is_some() {
            order.push(StimulusKey::Synth);
        }
        order
    }

    pub fn label(&self, key: StimulusKey) -> Option<&str> {
        match key {
            StimulusKey::Picture(i) => self.pictures.get(i as usize).map(String::as_str),
            StimulusKey::Keyword(i) => self.keywords.get(i as usize).map(String::as_str),
            StimulusKey::Synth => self.synth.as_ref().map(|s| s.name.as_str()),
        }
    }

    /// Stable identity string used for artifact hashing and status text.
    pub fn identity(&self, key: StimulusKey) -> String {
        let label = self.label(key).unwrap_or("?");
        match key {
            StimulusKey::Picture(_) => format!("picture:{label}"),
            StimulusKey::Keyword(_) => format!("keyword:{label}"),
            StimulusKey::Synth => format!("synth:{label}"),
        }
    }

    /// Regressor input width: the state for enumerable stimuli, or
    /// `synth_before ++ synth_after ++ state` for the synth model.
    pub fn input_dim(&self, key: StimulusKey, signal_count: usize) -> usize {
        match key {
            StimulusKey::Synth => 2 * self.synth_param_count() + signal_count,
            _ => signal_count,
        }
    }
}

fn load_pictures(path: &Path) -> Result<Vec<String>, EngineError> {
    if !path.is_dir() {
        return read_lines(path);
    }
    let entries = fs::read_dir(path)
        .map_err(|e| EngineError::Catalog(format!("cannot list {:?}: {e}", path)))?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|x| x.to_str())
                .map(|x| PICTURE_EXTENSIONS.contains(&x.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

fn read_lines(path: &Path) -> Result<Vec<String>, EngineError> {
    let text = fs::read_to_string(path)
        .map_err(|e| EngineError::Catalog(format!("cannot read {:?}: {e}", path)))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StimulusCatalog {
        StimulusCatalog::from_labels(
            vec!["sea.png".to_string(), "forest.jpg".to_string()],
            vec!["calm".to_string()],
            Some(SynthSpec {
                name: "pad".to_string(),
                param_count: 3,
            }),
        )
    }

    #[test]
    fn training_order_is_pictures_keywords_synth() {
        let c = catalog();
        assert_eq!(
            c.training_order(),
            vec![
                StimulusKey::Picture(0),
                StimulusKey::Picture(1),
                StimulusKey::Keyword(0),
                StimulusKey::Synth,
            ]
        );
    }

    #[test]
    fn identities_are_tagged() {
        let c = catalog();
        assert_eq!(c.identity(StimulusKey::Picture(1)), "picture:forest.jpg");
        assert_eq!(c.identity(StimulusKey::Keyword(0)), "keyword:calm");
        assert_eq!(c.identity(StimulusKey::Synth), "synth:pad");
        assert_eq!(c.input_dim(StimulusKey::Synth, 2), 8);
        assert_eq!(c.input_dim(StimulusKey::Keyword(0), 2), 2);
    }

    #[test]
    fn loads_sources_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pics = dir.path().join("pics");
        fs::create_dir(&pics).unwrap();
        fs::write(pics.join("b.png"), b"").unwrap();
        fs::write(pics.join("a.JPG"), b"").unwrap();
        fs::write(pics.join("notes.txt"), b"").unwrap();
        let words = dir.path().join("words.txt");
        fs::write(&words, "# header\nsun\n\n  moon  \n").unwrap();

        let c = StimulusCatalog::load(&CatalogSpec {
            pictures: Some(pics),
            keywords: Some(words),
            keyword_labels: vec!["star".to_string()],
            ..CatalogSpec::default()
        })
        .unwrap();
        assert_eq!(c.label(StimulusKey::Picture(0)), Some("a.JPG"));
        assert_eq!(c.label(StimulusKey::Picture(1)), Some("b.png"));
        assert_eq!(c.picture_count(), 2);
        assert_eq!(c.label(StimulusKey::Keyword(1)), Some("moon"));
        assert_eq!(c.label(StimulusKey::Keyword(2)), Some("star"));
    }

    #[test]
    fn empty_catalog_is_an_error() {
        assert!(StimulusCatalog::load(&CatalogSpec::default()).is_err());
    }

    #[test]
    fn inline_catalog_needs_no_files() {
        let c = StimulusCatalog::load(&CatalogSpec::inline(&["x.png"], &["calm", "alert"], None))
            .unwrap();
        assert_eq!(c.picture_count(), 1);
        assert_eq!(c.keyword_count(), 2);
        assert!(c.synth().is_none());
    }
}
